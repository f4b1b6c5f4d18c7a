//! Accuracy metrics and confusion matrices.
//!
//! Metrics are computed host-side from hard labels; they never take part in
//! autodiff. Confusion matrices accumulate raw counts across an epoch and are
//! normalised when read.

use candle_core::{Tensor, D};
use ndarray::{Array2, Axis};

use crate::error::{Error, Result};

/// Row-wise argmax of a `(N, K)` score tensor.
pub fn argmax_rows(x: &Tensor) -> Result<Vec<usize>> {
    if x.dim(0)? == 0 {
        return Ok(Vec::new());
    }
    Ok(x.argmax(D::Minus1)?
        .to_vec1::<u32>()?
        .into_iter()
        .map(|c| c as usize)
        .collect())
}

/// Per-class accuracy (recall) in percent.
///
/// Targets equal to `ignore_index` are skipped. A class with no support
/// scores 0.
pub fn class_accuracy(
    pred: &[usize],
    target: &[i64],
    num_classes: usize,
    ignore_index: Option<i64>,
) -> Result<Vec<f32>> {
    let mut hits = vec![0usize; num_classes];
    let mut support = vec![0usize; num_classes];
    for (&p, &t) in pred.iter().zip(target) {
        if Some(t) == ignore_index {
            continue;
        }
        let t = label(t, num_classes)?;
        support[t] += 1;
        if p == t {
            hits[t] += 1;
        }
    }
    Ok(hits
        .iter()
        .zip(&support)
        .map(|(&h, &s)| if s == 0 { 0.0 } else { 100.0 * h as f32 / s as f32 })
        .collect())
}

/// Fraction of correct thresholded predictions, in percent.
pub fn binary_accuracy(prob: &[f32], target: &[f32]) -> f32 {
    if prob.is_empty() {
        return 0.0;
    }
    let correct = prob
        .iter()
        .zip(target)
        .filter(|(&p, &t)| (p > 0.5) == (t > 0.5))
        .count();
    100.0 * correct as f32 / prob.len() as f32
}

/// Mean Euclidean distance between predicted and true rows.
pub fn mean_distance(pred: &Tensor, target: &Tensor) -> Result<f32> {
    if pred.dim(0)? == 0 {
        return Ok(0.0);
    }
    let d = (pred - target)?.sqr()?.sum(D::Minus1)?.sqrt()?;
    Ok(d.mean_all()?.to_scalar::<f32>()?)
}

fn label(t: i64, num_classes: usize) -> Result<usize> {
    if t < 0 || t as usize >= num_classes {
        return Err(Error::InvalidLabel {
            label: t,
            num_classes,
        });
    }
    Ok(t as usize)
}

/// How a confusion matrix is normalised when read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalize {
    /// Rows (true labels) sum to one: recall on the diagonal.
    True,
    /// Columns (predictions) sum to one: precision on the diagonal.
    Pred,
}

/// Normalise a count matrix. Empty rows or columns stay zero.
pub fn normalize(counts: &Array2<f64>, how: Normalize) -> Array2<f64> {
    let axis = match how {
        Normalize::True => Axis(1),
        Normalize::Pred => Axis(0),
    };
    let sums = counts.sum_axis(axis);
    let mut out = counts.clone();
    for ((i, j), v) in out.indexed_iter_mut() {
        let s = match how {
            Normalize::True => sums[i],
            Normalize::Pred => sums[j],
        };
        *v = if s > 0.0 { *v / s } else { 0.0 };
    }
    out
}

/// Epoch-scoped confusion counts, rows true label, columns prediction.
#[derive(Debug, Clone)]
pub struct ConfusionMatrix {
    counts: Array2<f64>,
    ignore_index: Option<i64>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize, ignore_index: Option<i64>) -> Self {
        Self {
            counts: Array2::zeros((num_classes, num_classes)),
            ignore_index,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.counts.nrows()
    }

    /// Raw counts accumulated so far.
    pub fn counts(&self) -> &Array2<f64> {
        &self.counts
    }

    /// Add one batch of hard labels.
    pub fn update(&mut self, pred: &[usize], target: &[i64]) -> Result<()> {
        let k = self.num_classes();
        for (&p, &t) in pred.iter().zip(target) {
            if Some(t) == self.ignore_index {
                continue;
            }
            let t = label(t, k)?;
            let p = label(p as i64, k)?;
            self.counts[[t, p]] += 1.0;
        }
        Ok(())
    }

    /// Return the accumulated counts and start over.
    pub fn read_and_reset(&mut self) -> Array2<f64> {
        let k = self.num_classes();
        std::mem::replace(&mut self.counts, Array2::zeros((k, k)))
    }
}

/// Receives normalised confusion matrices at the end of an epoch.
pub trait ConfusionSink {
    fn record(&mut self, tag: &str, classes: &[String], matrix: &Array2<f64>, epoch: usize);
}

/// Writes confusion matrices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ConfusionSink for LogSink {
    fn record(&mut self, tag: &str, classes: &[String], matrix: &Array2<f64>, epoch: usize) {
        for (name, row) in classes.iter().zip(matrix.rows()) {
            let cells: Vec<String> = row.iter().map(|v| format!("{v:.3}")).collect();
            tracing::info!(tag, epoch, class = %name, row = %cells.join(" "), "confusion");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use ndarray::array;

    #[test]
    fn test_class_accuracy_ignores_label() {
        let acc = class_accuracy(&[0, 1, 2, 2], &[0, -1, 2, 1], 4, Some(-1)).unwrap();
        assert_eq!(acc, vec![100.0, 0.0, 100.0, 0.0]);
        assert!(class_accuracy(&[0], &[7], 4, Some(-1)).is_err());
    }

    #[test]
    fn test_binary_accuracy() {
        assert_eq!(binary_accuracy(&[0.9, 0.2, 0.6, 0.4], &[1.0, 0.0, 0.0, 0.0]), 75.0);
        assert_eq!(binary_accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn test_argmax_and_distance() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[0.1f32, 0.7, 0.2], [3.0, -1.0, 0.0]], &device).unwrap();
        assert_eq!(argmax_rows(&x).unwrap(), vec![1, 0]);

        let a = Tensor::new(&[[0f32, 0., 0.], [1., 1., 1.]], &device).unwrap();
        let b = Tensor::new(&[[3f32, 4., 0.], [1., 1., 1.]], &device).unwrap();
        assert!((mean_distance(&a, &b).unwrap() - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_confusion_normalisation() {
        let mut cm = ConfusionMatrix::new(3, Some(-1));
        cm.update(&[0, 1, 1, 0, 2], &[0, 1, 0, -1, 0]).unwrap();
        let counts = cm.read_and_reset();
        assert_eq!(counts, array![[1., 1., 1.], [0., 1., 0.], [0., 0., 0.]]);
        assert_eq!(cm.counts().sum(), 0.0);

        let recall = normalize(&counts, Normalize::True);
        assert!((recall[[0, 0]] - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(recall.row(2).sum(), 0.0);

        let precision = normalize(&counts, Normalize::Pred);
        assert_eq!(precision[[0, 0]], 1.0);
        assert_eq!(precision[[1, 1]], 0.5);
    }
}
