use candle_core::{Module, Tensor, D};

use crate::error::{ConversionError, Result};

/// Operation vocabulary shared by the eager reference model, the export tracer
/// and the graph interpreter.
///
/// Every operation is shape-agnostic with respect to batch and sequence axes;
/// the only way for a model to observe a concrete size is [`GraphOps::dim`],
/// which the tracer treats as a shape capture.
pub trait GraphOps {
    type Value: Clone;

    fn constant(&mut self, name: &str, tensor: &Tensor) -> Result<Self::Value>;
    fn conv1d(
        &mut self,
        x: &Self::Value,
        weight: &Self::Value,
        bias: Option<&Self::Value>,
        params: Conv1dParams,
    ) -> Result<Self::Value>;
    /// `x @ weight^T + bias` with `weight` laid out as `[out, in]`.
    fn linear(
        &mut self,
        x: &Self::Value,
        weight: &Self::Value,
        bias: Option<&Self::Value>,
    ) -> Result<Self::Value>;
    fn matmul(&mut self, a: &Self::Value, b: &Self::Value) -> Result<Self::Value>;
    fn add(&mut self, a: &Self::Value, b: &Self::Value) -> Result<Self::Value>;
    fn scale(&mut self, x: &Self::Value, factor: f64) -> Result<Self::Value>;
    fn gelu(&mut self, x: &Self::Value) -> Result<Self::Value>;
    fn softmax(&mut self, x: &Self::Value) -> Result<Self::Value>;
    fn layer_norm(
        &mut self,
        x: &Self::Value,
        weight: &Self::Value,
        bias: &Self::Value,
        eps: f64,
    ) -> Result<Self::Value>;
    fn group_norm(
        &mut self,
        x: &Self::Value,
        weight: &Self::Value,
        bias: &Self::Value,
        num_groups: usize,
        eps: f64,
    ) -> Result<Self::Value>;
    fn transpose(&mut self, x: &Self::Value, dim0: usize, dim1: usize) -> Result<Self::Value>;
    fn unsqueeze(&mut self, x: &Self::Value, dim: usize) -> Result<Self::Value>;
    /// `[b, t, h*d] -> [b, h, t, d]`
    fn split_heads(&mut self, x: &Self::Value, num_heads: usize) -> Result<Self::Value>;
    /// `[b, h, t, d] -> [b, t, h*d]`
    fn merge_heads(&mut self, x: &Self::Value) -> Result<Self::Value>;
    fn drop_tail(&mut self, x: &Self::Value, axis: usize, count: usize) -> Result<Self::Value>;
    fn dim(&mut self, x: &Self::Value, axis: usize) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv1dParams {
    pub stride: usize,
    pub padding: usize,
    pub groups: usize,
}

impl Default for Conv1dParams {
    fn default() -> Self {
        Self {
            stride: 1,
            padding: 0,
            groups: 1,
        }
    }
}

/// Immediate execution on candle tensors.
#[derive(Debug, Default, Clone, Copy)]
pub struct Eager;

impl GraphOps for Eager {
    type Value = Tensor;

    fn constant(&mut self, _name: &str, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn conv1d(
        &mut self,
        x: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        params: Conv1dParams,
    ) -> Result<Tensor> {
        kernels::conv1d(x, weight, bias, params).map_err(|e| ConversionError::inference("conv1d", e))
    }

    fn linear(&mut self, x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        kernels::linear(x, weight, bias).map_err(|e| ConversionError::inference("linear", e))
    }

    fn matmul(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        kernels::matmul(a, b).map_err(|e| ConversionError::inference("matmul", e))
    }

    fn add(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        a.broadcast_add(b)
            .map_err(|e| ConversionError::inference("add", e))
    }

    fn scale(&mut self, x: &Tensor, factor: f64) -> Result<Tensor> {
        x.affine(factor, 0.0)
            .map_err(|e| ConversionError::inference("scale", e))
    }

    fn gelu(&mut self, x: &Tensor) -> Result<Tensor> {
        x.gelu().map_err(|e| ConversionError::inference("gelu", e))
    }

    fn softmax(&mut self, x: &Tensor) -> Result<Tensor> {
        candle_nn::ops::softmax_last_dim(x).map_err(|e| ConversionError::inference("softmax", e))
    }

    fn layer_norm(&mut self, x: &Tensor, weight: &Tensor, bias: &Tensor, eps: f64) -> Result<Tensor> {
        kernels::layer_norm(x, weight, bias, eps)
            .map_err(|e| ConversionError::inference("layer_norm", e))
    }

    fn group_norm(
        &mut self,
        x: &Tensor,
        weight: &Tensor,
        bias: &Tensor,
        num_groups: usize,
        eps: f64,
    ) -> Result<Tensor> {
        kernels::group_norm(x, weight, bias, num_groups, eps)
            .map_err(|e| ConversionError::inference("group_norm", e))
    }

    fn transpose(&mut self, x: &Tensor, dim0: usize, dim1: usize) -> Result<Tensor> {
        x.transpose(dim0, dim1)
            .and_then(|t| t.contiguous())
            .map_err(|e| ConversionError::inference("transpose", e))
    }

    fn unsqueeze(&mut self, x: &Tensor, dim: usize) -> Result<Tensor> {
        x.unsqueeze(dim)
            .map_err(|e| ConversionError::inference("unsqueeze", e))
    }

    fn split_heads(&mut self, x: &Tensor, num_heads: usize) -> Result<Tensor> {
        kernels::split_heads(x, num_heads).map_err(|e| ConversionError::inference("split_heads", e))
    }

    fn merge_heads(&mut self, x: &Tensor) -> Result<Tensor> {
        kernels::merge_heads(x).map_err(|e| ConversionError::inference("merge_heads", e))
    }

    fn drop_tail(&mut self, x: &Tensor, axis: usize, count: usize) -> Result<Tensor> {
        kernels::drop_tail(x, axis, count).map_err(|e| ConversionError::inference("drop_tail", e))
    }

    fn dim(&mut self, x: &Tensor, axis: usize) -> Result<usize> {
        x.dim(axis).map_err(|e| ConversionError::inference("dim", e))
    }
}

/// Candle implementations of the graph operations, shared by every executor.
pub(crate) mod kernels {
    use super::*;

    pub(crate) fn conv1d(
        x: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        params: Conv1dParams,
    ) -> candle_core::Result<Tensor> {
        let y = x.conv1d(weight, params.padding, params.stride, 1, params.groups)?;
        match bias {
            Some(bias) => {
                let channels = bias.dim(0)?;
                y.broadcast_add(&bias.reshape((1, channels, 1))?)
            }
            None => Ok(y),
        }
    }

    pub(crate) fn linear(
        x: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        candle_nn::Linear::new(weight.clone(), bias.cloned()).forward(x)
    }

    pub(crate) fn matmul(a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
        a.contiguous()?.matmul(&b.contiguous()?)
    }

    pub(crate) fn layer_norm(
        x: &Tensor,
        weight: &Tensor,
        bias: &Tensor,
        eps: f64,
    ) -> candle_core::Result<Tensor> {
        let hidden = weight.dim(0)? as f64;
        let mean = (x.sum_keepdim(D::Minus1)? / hidden)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden)?;
        let normed = centered.broadcast_div(&(var + eps)?.sqrt()?)?;
        normed.broadcast_mul(weight)?.broadcast_add(bias)
    }

    /// GroupNorm over `(channels_per_group, time)` of a `[batch, channels, time]` input.
    pub(crate) fn group_norm(
        x: &Tensor,
        weight: &Tensor,
        bias: &Tensor,
        num_groups: usize,
        eps: f64,
    ) -> candle_core::Result<Tensor> {
        let (b, c, t) = x.dims3()?;
        if num_groups == 0 || c % num_groups != 0 {
            return Err(candle_core::Error::Msg(format!(
                "invalid GroupNorm shape/groups: channels={c}, groups={num_groups}"
            )));
        }

        let channels_per_group = c / num_groups;
        let denom = (channels_per_group * t) as f64;

        let grouped = x.reshape((b, num_groups, channels_per_group, t))?;
        let mean = (grouped.sum_keepdim(D::Minus1)?.sum_keepdim(D::Minus2)? / denom)?;
        let centered = grouped.broadcast_sub(&mean)?;
        let var = (centered.sqr()?.sum_keepdim(D::Minus1)?.sum_keepdim(D::Minus2)? / denom)?;
        let normed = centered.broadcast_div(&(var + eps)?.sqrt()?)?;
        let normed = normed.reshape((b, c, t))?;

        let weight = weight.reshape((1, c, 1))?;
        let bias = bias.reshape((1, c, 1))?;
        normed.broadcast_mul(&weight)?.broadcast_add(&bias)
    }

    pub(crate) fn split_heads(x: &Tensor, num_heads: usize) -> candle_core::Result<Tensor> {
        let (b, t, hidden) = x.dims3()?;
        if num_heads == 0 || hidden % num_heads != 0 {
            return Err(candle_core::Error::Msg(format!(
                "hidden size {hidden} is not divisible by {num_heads} heads"
            )));
        }
        x.reshape((b, t, num_heads, hidden / num_heads))?
            .transpose(1, 2)?
            .contiguous()
    }

    pub(crate) fn merge_heads(x: &Tensor) -> candle_core::Result<Tensor> {
        let (b, h, t, d) = x.dims4()?;
        x.transpose(1, 2)?.contiguous()?.reshape((b, t, h * d))
    }

    pub(crate) fn drop_tail(x: &Tensor, axis: usize, count: usize) -> candle_core::Result<Tensor> {
        let len = x.dim(axis)?;
        if count >= len {
            return Err(candle_core::Error::Msg(format!(
                "cannot drop {count} trailing elements from axis {axis} of length {len}"
            )));
        }
        x.narrow(axis, 0, len - count)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn split_then_merge_heads_is_identity() {
        let x = Tensor::arange(0f32, 24.0, &Device::Cpu)
            .and_then(|t| t.reshape((1, 3, 8)))
            .expect("tensor");
        let mut ops = Eager;
        let split = ops.split_heads(&x, 2).expect("split");
        assert_eq!(split.dims(), &[1, 2, 3, 4]);
        let merged = ops.merge_heads(&split).expect("merge");
        assert_eq!(
            merged.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            x.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn drop_tail_rejects_overrun() {
        let x = Tensor::zeros((1, 2, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let mut ops = Eager;
        assert_eq!(ops.drop_tail(&x, 2, 1).unwrap().dims(), &[1, 2, 2]);
        assert!(ops.drop_tail(&x, 2, 3).is_err());
    }

    #[test]
    fn layer_norm_centers_each_row() {
        let x = Tensor::new(&[[1f32, 2.0, 3.0, 4.0]], &Device::Cpu).unwrap();
        let w = Tensor::ones(4, candle_core::DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros(4, candle_core::DType::F32, &Device::Cpu).unwrap();
        let y = Eager.layer_norm(&x, &w, &b, 1e-5).unwrap();
        let row = y.to_vec2::<f32>().unwrap().remove(0);
        let mean: f32 = row.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!(row[0] < row[3]);
    }
}
