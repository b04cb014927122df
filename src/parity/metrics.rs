use candle_core::{Tensor, D};
use serde::Serialize;

use crate::config::ParityConfig;
use crate::error::{ConversionError, Result};
use crate::types::Verdict;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ElementwiseDiff {
    pub max_abs_diff: f32,
    pub mean_abs_diff: f32,
}

fn check_same_shape(context: &'static str, a: &Tensor, b: &Tensor) -> Result<()> {
    if a.dims() != b.dims() {
        return Err(ConversionError::shape_contract(
            context,
            format!("shapes differ: {:?} vs {:?}", a.dims(), b.dims()),
        ));
    }
    Ok(())
}

pub fn elementwise_diff(a: &Tensor, b: &Tensor) -> Result<ElementwiseDiff> {
    check_same_shape("elementwise diff", a, b)?;
    let diff = (a - b)
        .and_then(|d| d.abs())
        .and_then(|d| d.flatten_all())
        .map_err(|e| ConversionError::inference("elementwise diff", e))?;
    if diff.elem_count() == 0 {
        return Ok(ElementwiseDiff {
            max_abs_diff: 0.0,
            mean_abs_diff: 0.0,
        });
    }
    let max_abs_diff = diff
        .max(0)
        .and_then(|m| m.to_scalar::<f32>())
        .map_err(|e| ConversionError::inference("elementwise diff", e))?;
    let mean_abs_diff = diff
        .mean(0)
        .and_then(|m| m.to_scalar::<f32>())
        .map_err(|e| ConversionError::inference("elementwise diff", e))?;
    Ok(ElementwiseDiff {
        max_abs_diff,
        mean_abs_diff,
    })
}

/// Fraction of frames whose top-1 label agrees. Frames are every position but the last axis.
pub fn argmax_agreement(a: &Tensor, b: &Tensor) -> Result<f64> {
    check_same_shape("argmax agreement", a, b)?;
    let argmax = |t: &Tensor| {
        t.argmax(D::Minus1)
            .and_then(|i| i.flatten_all())
            .and_then(|i| i.to_vec1::<u32>())
            .map_err(|e| ConversionError::inference("argmax agreement", e))
    };
    let la = argmax(a)?;
    let lb = argmax(b)?;
    if la.is_empty() {
        return Ok(1.0);
    }
    let matching = la.iter().zip(&lb).filter(|(x, y)| x == y).count();
    Ok(matching as f64 / la.len() as f64)
}

pub fn classify(rate: f64, config: &ParityConfig) -> Verdict {
    if rate >= config.pass_rate {
        Verdict::Pass
    } else if rate >= config.warn_rate {
        Verdict::Warn
    } else {
        Verdict::Fail
    }
}
