//! Class-grouped linear maps.
//!
//! Every hidden tensor in the network has width `C x F`: `C` contiguous
//! blocks of `F` features, one per semantic class. [`ClassLinear`] applies
//! an independent affine map to each block, so nothing mixes across classes.
//!
//! ```text
//! [ x_0 | x_1 | ... | x_{C-1} ]  ->  [ W_0 x_0 + b_0 | ... | W_{C-1} x_{C-1} + b_{C-1} ]
//! ```

use candle_core::{Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::error::{Error, Result};

/// Split a class-partitioned width into its block width.
pub fn class_block(width: usize, num_classes: usize) -> Result<usize> {
    if num_classes == 0 || width % num_classes != 0 {
        return Err(Error::ClassPartition { width, num_classes });
    }
    Ok(width / num_classes)
}

/// Concatenate class-partitioned tensors block by block.
///
/// Class `c` of the result is `[a_c, b_c, ...]`. All parts must have the
/// same number of rows.
pub fn cat_classes(parts: &[&Tensor], num_classes: usize) -> Result<Tensor> {
    let rows = match parts.first() {
        Some(t) => t.dim(0)?,
        None => return Err(Error::InvalidConfig("cat_classes of nothing".into())),
    };
    let mut blocks = Vec::with_capacity(parts.len());
    let mut width = 0;
    for part in parts {
        let f = class_block(part.dim(D::Minus1)?, num_classes)?;
        blocks.push(part.reshape((rows, num_classes, f))?);
        width += f;
    }
    let joined = Tensor::cat(&blocks, 2)?;
    Ok(joined.reshape((rows, num_classes * width))?)
}

/// Replicate an unpartitioned `(N, F)` tensor into `C` identical blocks.
pub fn repeat_classes(x: &Tensor, num_classes: usize) -> Result<Tensor> {
    Ok(x.repeat((1, num_classes))?)
}

/// One affine map per class block.
#[derive(Debug, Clone)]
pub struct ClassLinear {
    nets: Vec<Linear>,
    in_features: usize,
    out_features: usize,
}

impl ClassLinear {
    /// Create a class-grouped layer mapping `C x in_features` to
    /// `C x out_features`.
    pub fn new(
        in_features: usize,
        out_features: usize,
        num_classes: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_classes == 0 {
            return Err(Error::InvalidConfig("ClassLinear needs at least one class".into()));
        }
        let nets = (0..num_classes)
            .map(|c| linear(in_features, out_features, vb.pp(c)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            nets,
            in_features,
            out_features,
        })
    }

    /// Assemble from existing per-class layers.
    pub fn from_linears(nets: Vec<Linear>, in_features: usize, out_features: usize) -> Self {
        Self {
            nets,
            in_features,
            out_features,
        }
    }

    /// Per-class layers, in class order.
    pub fn linears(&self) -> &[Linear] {
        &self.nets
    }

    pub fn num_classes(&self) -> usize {
        self.nets.len()
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// - `x`: `(N, C * in_features)`
    ///
    /// # Returns
    /// - `(N, C * out_features)`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let num_classes = self.num_classes();
        let block = class_block(x.dim(D::Minus1)?, num_classes)?;
        if block != self.in_features {
            return Err(Error::DimensionMismatch {
                expected: self.in_features,
                got: block,
            });
        }
        let n = x.dim(0)?;
        if n == 0 {
            return Ok(Tensor::zeros(
                (0, num_classes * self.out_features),
                x.dtype(),
                x.device(),
            )?);
        }
        let outs = self
            .nets
            .iter()
            .enumerate()
            .map(|(c, net)| {
                let xc = x.narrow(D::Minus1, c * block, block)?.contiguous()?;
                net.forward(&xc)
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::cat(&outs, D::Minus1)?)
    }
}
