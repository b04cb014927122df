//! Symmetric int8 weights, asymmetric uint8 activations, i32 accumulation.

use rayon::prelude::*;

const I8_MAX: f32 = 127.0;
const U8_MAX: f32 = 255.0;

/// `[out_features, in_features]` int8 weight with one scale per output row
/// (or a single scale shared by every row).
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedWeight {
    pub values: Vec<i8>,
    pub scales: Vec<f32>,
    pub out_features: usize,
    pub in_features: usize,
}

impl QuantizedWeight {
    pub fn scale(&self, row: usize) -> f32 {
        if self.scales.len() == 1 {
            self.scales[0]
        } else {
            self.scales[row]
        }
    }

    pub fn dequantize(&self) -> Vec<f32> {
        let mut out = vec![0f32; self.values.len()];
        out.par_chunks_mut(self.in_features.max(1))
            .zip(self.values.par_chunks(self.in_features.max(1)))
            .enumerate()
            .for_each(|(row, (dst, src))| {
                let scale = self.scale(row);
                for (d, &q) in dst.iter_mut().zip(src) {
                    *d = q as f32 * scale;
                }
            });
        out
    }
}

fn symmetric_scale(values: &[f32]) -> f32 {
    let max_abs = values.iter().fold(0f32, |m, &v| m.max(v.abs()));
    if max_abs > 0.0 {
        max_abs / I8_MAX
    } else {
        1.0
    }
}

fn quantize_value(value: f32, scale: f32) -> i8 {
    (value / scale).round().clamp(-I8_MAX, I8_MAX) as i8
}

/// Quantizes a row-major `[out_features, in_features]` weight.
pub fn quantize_weight(
    weight: &[f32],
    out_features: usize,
    in_features: usize,
    per_channel: bool,
) -> QuantizedWeight {
    let row_len = in_features.max(1);
    let scales: Vec<f32> = if per_channel {
        weight.par_chunks(row_len).map(symmetric_scale).collect()
    } else {
        vec![symmetric_scale(weight)]
    };

    let mut values = vec![0i8; weight.len()];
    values
        .par_chunks_mut(row_len)
        .zip(weight.par_chunks(row_len))
        .enumerate()
        .for_each(|(row, (dst, src))| {
            let scale = if per_channel { scales[row] } else { scales[0] };
            for (d, &v) in dst.iter_mut().zip(src) {
                *d = quantize_value(v, scale);
            }
        });

    QuantizedWeight {
        values,
        scales,
        out_features,
        in_features,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedActivations {
    pub values: Vec<u8>,
    pub scale: f32,
    pub zero_point: u8,
}

/// Per-call uint8 quantization. The range always includes zero so that zero
/// is exactly representable.
pub fn quantize_activations(x: &[f32]) -> QuantizedActivations {
    let (min, max) = x
        .iter()
        .fold((0f32, 0f32), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;
    let scale = if range > 0.0 { range / U8_MAX } else { 1.0 };
    let zero_point = (-min / scale).round().clamp(0.0, U8_MAX) as u8;
    let zp = zero_point as f32;
    let values = x
        .par_iter()
        .map(|&v| ((v / scale).round() + zp).clamp(0.0, U8_MAX) as u8)
        .collect();
    QuantizedActivations {
        values,
        scale,
        zero_point,
    }
}

/// `y = dequant(quant(x) @ w^T) + bias` for `rows` rows of `in_features` values.
pub fn dynamic_quantized_linear(
    x: &[f32],
    rows: usize,
    weight: &QuantizedWeight,
    bias: Option<&[f32]>,
) -> Vec<f32> {
    let k = weight.in_features;
    let n = weight.out_features;
    let act = quantize_activations(x);
    let zp = act.zero_point as i32;

    let mut out = vec![0f32; rows * n];
    out.par_chunks_mut(n.max(1))
        .zip(act.values.par_chunks(k.max(1)))
        .for_each(|(dst, row)| {
            for (o, y) in dst.iter_mut().enumerate() {
                let w_row = &weight.values[o * k..(o + 1) * k];
                let acc: i32 = row
                    .iter()
                    .zip(w_row)
                    .map(|(&q, &w)| (q as i32 - zp) * w as i32)
                    .sum();
                *y = acc as f32 * act.scale * weight.scale(o) + bias.map_or(0.0, |b| b[o]);
            }
        });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_channel_scales_follow_row_max() {
        let w = [1.27f32, -0.5, 0.0, 0.0, 2.54, -2.54];
        let q = quantize_weight(&w, 3, 2, true);
        assert_eq!(q.scales.len(), 3);
        assert!((q.scales[0] - 0.01).abs() < 1e-7);
        assert_eq!(q.scales[1], 1.0, "all-zero row uses unit scale");
        assert_eq!(q.values, vec![127, -50, 0, 0, 127, -127]);
    }

    #[test]
    fn per_tensor_uses_single_scale() {
        let w = [1.0f32, -2.0, 0.5, 0.25];
        let q = quantize_weight(&w, 2, 2, false);
        assert_eq!(q.scales.len(), 1);
        assert_eq!(q.values[1], -127);
    }

    #[test]
    fn zero_activations_are_exact() {
        let act = quantize_activations(&[0.0; 4]);
        assert_eq!(act.scale, 1.0);
        assert_eq!(act.zero_point, 0);
        assert!(act.values.iter().all(|&v| v == 0));
    }

    #[test]
    fn activation_range_includes_zero() {
        let act = quantize_activations(&[1.0, 2.0]);
        // range [0, 2]
        assert_eq!(act.zero_point, 0);
        assert_eq!(act.values[1], 255);
    }

    #[test]
    fn quantized_linear_tracks_float_result() {
        let x = [0.3f32, -0.7, 0.1, 0.9, -0.2, 0.4];
        let w = [0.5f32, -0.25, 0.75, -1.0, 0.1, 0.2];
        let bias = [0.05f32, -0.1];
        let q = quantize_weight(&w, 2, 3, true);
        let y = dynamic_quantized_linear(&x, 2, &q, Some(&bias));
        for r in 0..2 {
            for o in 0..2 {
                let exact: f32 = (0..3).map(|k| x[r * 3 + k] * w[o * 3 + k]).sum::<f32>() + bias[o];
                assert!((y[r * 2 + o] - exact).abs() < 0.02, "row {r} out {o}");
            }
        }
    }

    #[test]
    fn zero_input_yields_bias() {
        let q = quantize_weight(&[0.3, -0.4], 1, 2, true);
        let y = dynamic_quantized_linear(&[0.0, 0.0], 1, &q, Some(&[0.7]));
        assert_eq!(y, vec![0.7]);
    }
}
