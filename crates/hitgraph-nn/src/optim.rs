//! AdamW with a one-cycle learning-rate schedule.
//!
//! The schedule warms up from `max_lr / 25` to `max_lr` over the first 30%
//! of the steps, then anneals to `max_lr / 25 / 1e4`, both phases following a
//! half cosine. It advances once per optimisation step; the caller supplies
//! the total step count.

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::error::{Error, Result};

/// One-cycle learning-rate schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OneCycleLr {
    max_lr: f64,
    total_steps: usize,
    pct_start: f64,
    div_factor: f64,
    final_div_factor: f64,
}

fn cosine(start: f64, end: f64, pct: f64) -> f64 {
    end + (start - end) / 2.0 * ((std::f64::consts::PI * pct).cos() + 1.0)
}

impl OneCycleLr {
    pub fn new(max_lr: f64, total_steps: usize) -> Result<Self> {
        if total_steps == 0 {
            return Err(Error::InvalidConfig("one-cycle schedule needs at least one step".into()));
        }
        if !(max_lr.is_finite() && max_lr > 0.0) {
            return Err(Error::InvalidConfig(format!("invalid learning rate {max_lr}")));
        }
        Ok(Self {
            max_lr,
            total_steps,
            pct_start: 0.3,
            div_factor: 25.0,
            final_div_factor: 1e4,
        })
    }

    pub fn max_lr(&self) -> f64 {
        self.max_lr
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn initial_lr(&self) -> f64 {
        self.max_lr / self.div_factor
    }

    pub fn min_lr(&self) -> f64 {
        self.initial_lr() / self.final_div_factor
    }

    /// Step at which the warm-up phase ends.
    pub fn peak_step(&self) -> usize {
        let end = (self.pct_start * self.total_steps as f64) - 1.0;
        end.max(0.0) as usize
    }

    /// Learning rate for optimisation step `step` (0-based). Steps past the
    /// end stay at the final rate.
    pub fn lr_at(&self, step: usize) -> f64 {
        let last = self.total_steps.saturating_sub(1);
        let step = step.min(last);
        let peak = self.peak_step();
        if step <= peak {
            if peak == 0 {
                return self.max_lr;
            }
            cosine(self.initial_lr(), self.max_lr, step as f64 / peak as f64)
        } else {
            let span = (last - peak).max(1) as f64;
            cosine(self.max_lr, self.min_lr(), (step - peak) as f64 / span)
        }
    }
}

/// AdamW whose learning rate follows a [`OneCycleLr`].
pub struct ScheduledAdamW {
    opt: AdamW,
    schedule: OneCycleLr,
    step: usize,
}

impl ScheduledAdamW {
    pub fn new(vars: Vec<Var>, schedule: OneCycleLr) -> Result<Self> {
        let params = ParamsAdamW {
            lr: schedule.lr_at(0),
            ..Default::default()
        };
        Ok(Self {
            opt: AdamW::new(vars, params)?,
            schedule,
            step: 0,
        })
    }

    /// Steps taken so far.
    pub fn steps(&self) -> usize {
        self.step
    }

    pub fn learning_rate(&self) -> f64 {
        self.opt.learning_rate()
    }

    pub fn schedule(&self) -> &OneCycleLr {
        &self.schedule
    }

    /// Apply one update with the scheduled rate, then advance the schedule.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.opt.set_learning_rate(self.schedule.lr_at(self.step));
        self.opt.step(grads)?;
        self.step += 1;
        Ok(())
    }
}
