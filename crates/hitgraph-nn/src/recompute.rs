//! Selective recomputation of plane convolutions.
//!
//! In recompute mode a convolution runs on a detached copy of its input and
//! its output is copied into a fresh leaf variable. Only the leaf, the
//! original input and the edges are kept; the convolution's intermediate
//! activations are dropped with the temporary graph.
//!
//! [`Recompute::backward`] first back-propagates the loss, which stops at
//! those leaves, then walks the recorded segments newest first. Each segment
//! re-runs its convolution, pulls the leaf's gradient through it and pushes
//! the resulting input gradient further upstream. Upstream passes reach the
//! leaves of older segments, which are processed later, so every
//! contribution lands in one [`GradStore`].
//!
//! Segments stay recorded until a backward pass reaches them. A loss may
//! therefore sum several forwards. Segments left behind by a forward whose
//! loss is never back-propagated are dropped by the next backward that
//! replays a newer segment, or by [`Recompute::clear`].
//!
//! ```text
//! forward:   x --detach--> conv --copy--> leaf --> ... --> loss
//! backward:  loss.backward()            => d leaf
//!            conv(x').backward(d leaf)  => d params, d x'
//!            x.backward(d x')           => d params, d older leaves
//! ```

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use std::sync::{Mutex, MutexGuard};

use crate::conv::ClassConv;
use crate::error::Result;

struct Segment {
    conv: ClassConv,
    input: Tensor,
    edge_index: Tensor,
    output: Var,
}

/// Tape of recomputable convolution segments.
#[derive(Default)]
pub struct Recompute {
    segments: Mutex<Vec<Segment>>,
}

impl std::fmt::Debug for Recompute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recompute")
            .field("segments", &self.len())
            .finish()
    }
}

fn accumulate(grads: &mut GradStore, t: &Tensor, g: &Tensor) -> Result<()> {
    let sum = match grads.get(t) {
        Some(prev) => (prev + g)?,
        None => g.clone(),
    };
    grads.insert(t, sum);
    Ok(())
}

impl Recompute {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Segment>> {
        self.segments.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of recorded segments.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all recorded segments.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Run a same-type convolution without keeping its activations.
    pub fn run(&self, conv: &ClassConv, x: &Tensor, edge_index: &Tensor) -> Result<Tensor> {
        let out = conv.forward(&x.detach(), edge_index)?;
        let output = Var::from_tensor(&out)?;
        let leaf = output.as_tensor().clone();
        self.lock().push(Segment {
            conv: conv.clone(),
            input: x.clone(),
            edge_index: edge_index.clone(),
            output,
        });
        Ok(leaf)
    }

    /// Back-propagate `loss`, replaying the recorded segments it depends on.
    ///
    /// Gradients are collected for `params` and for the segment leaves.
    /// Replayed segments leave the tape. Segments `loss` does not reach are
    /// dropped when they are older than the newest replayed one (a forward
    /// whose loss was never back-propagated) and kept otherwise, so several
    /// forwards may be summed into one loss or back-propagated in the order
    /// they were recorded.
    pub fn backward(&self, loss: &Tensor, params: &[Var]) -> Result<GradStore> {
        let segments = std::mem::take(&mut *self.lock());
        let mut grads = loss.backward()?;
        let mut replayed = vec![false; segments.len()];

        for (i, seg) in segments.iter().enumerate().rev() {
            let Some(g_out) = grads.remove(seg.output.as_tensor()) else {
                continue;
            };
            replayed[i] = true;
            let x = Var::from_tensor(&seg.input.detach())?;
            let out = seg.conv.forward(x.as_tensor(), &seg.edge_index)?;
            let local = (out * g_out.detach())?.sum_all()?.backward()?;
            for p in params {
                if let Some(g) = local.get(p.as_tensor()) {
                    accumulate(&mut grads, p.as_tensor(), g)?;
                }
            }

            let Some(g_in) = local.get(x.as_tensor()) else {
                continue;
            };
            let upstream = (&seg.input * g_in.detach())?.sum_all()?.backward()?;
            for p in params {
                if let Some(g) = upstream.get(p.as_tensor()) {
                    accumulate(&mut grads, p.as_tensor(), g)?;
                }
            }
            for older in &segments[..i] {
                if let Some(g) = upstream.get(older.output.as_tensor()) {
                    accumulate(&mut grads, older.output.as_tensor(), g)?;
                }
            }
        }

        let newest = replayed.iter().rposition(|&r| r);
        let num_replayed = replayed.iter().filter(|&&r| r).count();
        let pending: Vec<Segment> = segments
            .into_iter()
            .zip(replayed)
            .enumerate()
            .filter(|&(i, (_, done))| !done && newest.map_or(true, |n| i > n))
            .map(|(_, (seg, _))| seg)
            .collect();
        tracing::debug!(
            replayed = num_replayed,
            pending = pending.len(),
            "replayed recompute tape"
        );
        let mut tape = self.lock();
        let recorded = std::mem::replace(&mut *tape, pending);
        tape.extend(recorded);
        Ok(grads)
    }
}
