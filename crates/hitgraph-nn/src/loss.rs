//! Training objectives.
//!
//! - [`RecallLoss`]: cross entropy reweighted towards poorly recalled classes
//! - [`binary_cross_entropy`]: for probabilities from a sigmoid head
//! - [`mse`]: vertex regression

use candle_core::{DType, Tensor, D};

use crate::error::{Error, Result};
use crate::metrics::argmax_rows;

const EPS: f64 = 1e-7;

/// Multiclass loss that penalises low per-class recall.
///
/// Each valid node contributes its cross entropy weighted by
/// `1 - recall(target class)`, where recall comes from the current argmax
/// and is treated as a constant. The result is the mean over valid nodes,
/// or zero if every target is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecallLoss {
    pub ignore_index: Option<i64>,
}

impl Default for RecallLoss {
    fn default() -> Self {
        Self {
            ignore_index: Some(-1),
        }
    }
}

impl RecallLoss {
    pub fn new(ignore_index: Option<i64>) -> Self {
        Self { ignore_index }
    }

    /// # Arguments
    /// - `x`: scores `(N, K)`
    /// - `y`: integer targets `(N,)`
    pub fn forward(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let num_classes = x.dim(D::Minus1)?;
        let targets = y.to_dtype(DType::I64)?.to_vec1::<i64>()?;
        if let Some(&bad) = targets
            .iter()
            .find(|&&t| Some(t) != self.ignore_index && !(0..num_classes as i64).contains(&t))
        {
            return Err(Error::InvalidLabel {
                label: bad,
                num_classes,
            });
        }
        let (rows, labels): (Vec<u32>, Vec<u32>) = targets
            .iter()
            .enumerate()
            .filter(|(_, &t)| Some(t) != self.ignore_index)
            .map(|(i, &t)| (i as u32, t as u32))
            .unzip();
        if rows.is_empty() {
            return Ok(Tensor::zeros((), x.dtype(), x.device())?);
        }
        let n = rows.len();
        let device = x.device();
        let rows = Tensor::from_vec(rows, n, device)?;
        let x = x.index_select(&rows, 0)?;

        let pred = argmax_rows(&x)?;
        let mut hits = vec![0f32; num_classes];
        let mut support = vec![0f32; num_classes];
        for (&p, &t) in pred.iter().zip(&labels) {
            let t = t as usize;
            support[t] += 1.0;
            if p == t {
                hits[t] += 1.0;
            }
        }
        let weights: Vec<f32> = labels
            .iter()
            .map(|&t| 1.0 - hits[t as usize] / support[t as usize])
            .collect();
        let weights = Tensor::from_vec(weights, n, device)?.to_dtype(x.dtype())?;

        let labels = Tensor::from_vec(labels, (n, 1), device)?;
        let log_p = candle_nn::ops::log_softmax(&x, D::Minus1)?;
        let nll = log_p.gather(&labels, 1)?.squeeze(1)?.neg()?;
        Ok((nll * weights)?.mean_all()?)
    }
}

/// Binary cross entropy of probabilities `p` against targets `y` in {0, 1}.
pub fn binary_cross_entropy(p: &Tensor, y: &Tensor) -> Result<Tensor> {
    if p.elem_count() == 0 {
        return Ok(Tensor::zeros((), p.dtype(), p.device())?);
    }
    let pos = (p + EPS)?.log()?;
    let neg = (p.affine(-1.0, 1.0)? + EPS)?.log()?;
    let y_neg = y.affine(-1.0, 1.0)?;
    let ll = ((y * pos)? + (y_neg * neg)?)?;
    Ok(ll.mean_all()?.neg()?)
}

/// Mean squared error.
pub fn mse(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    if x.elem_count() == 0 {
        return Ok(Tensor::zeros((), x.dtype(), x.device())?);
    }
    Ok(candle_nn::loss::mse(x, y)?)
}
