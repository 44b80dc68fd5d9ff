//! Learning-rate scheduled optimizer wrapper.
use candle::backprop::GradStore;
use candle::{Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::config::{LrSchedule, OptimizerConfig};

/// Wraps AdamW with a schedule keyed by the global step. `pre_step` applies
/// the schedule before each update; `backward_step` runs backprop, clips the
/// gradient global norm and applies the update, returning the pre-clip norm.
pub struct ScheduledOptim {
    inner: AdamW,
    vars: Vec<Var>,
    init_lr: f64,
    schedule: LrSchedule,
    warmup_step: usize,
    max_grad_norm: f64,
}

impl ScheduledOptim {
    pub fn new(vars: Vec<Var>, config: &OptimizerConfig) -> Result<Self> {
        let params = ParamsAdamW {
            lr: config.lr,
            weight_decay: config.weight_decay,
            ..ParamsAdamW::default()
        };
        let inner = AdamW::new(vars.clone(), params)?;
        Ok(Self {
            inner,
            vars,
            init_lr: config.lr,
            schedule: config.lr_scheduler,
            warmup_step: config.warmup_step,
            max_grad_norm: config.max_grad_norm,
        })
    }

    /// Effective learning rate at a given global step.
    pub fn lr_at(&self, step: usize) -> f64 {
        match self.schedule {
            LrSchedule::Fixed => self.init_lr,
            LrSchedule::Warmup => {
                // Inverse-sqrt decay with linear warmup, normalized so the
                // peak rate at step == warmup_step equals the configured lr.
                let s = step.max(1) as f64;
                let w = self.warmup_step.max(1) as f64;
                self.init_lr * w.sqrt() * s.powf(-0.5).min(s * w.powf(-1.5))
            }
        }
    }

    /// Applies the schedule for the upcoming step and returns the rate. The
    /// gradient state needs no explicit reset: candle builds a fresh
    /// `GradStore` on every backward pass.
    pub fn pre_step(&mut self, step: usize) -> f64 {
        let lr = self.lr_at(step);
        self.inner.set_learning_rate(lr);
        lr
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<f64> {
        let mut grads = loss.backward()?;
        let norm = self.grad_norm(&grads)?;
        if self.max_grad_norm > 0. && norm > self.max_grad_norm {
            let scale = self.max_grad_norm / (norm + 1e-6);
            for var in self.vars.iter() {
                if let Some(grad) = grads.get(var) {
                    let clipped = (grad * scale)?;
                    grads.insert(var, clipped);
                }
            }
        }
        self.inner.step(&grads)?;
        Ok(norm)
    }

    fn grad_norm(&self, grads: &GradStore) -> Result<f64> {
        let mut sum_sq = 0f64;
        for var in self.vars.iter() {
            if let Some(grad) = grads.get(var) {
                sum_sq += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
            }
        }
        Ok(sum_sq.sqrt())
    }

    pub fn create_msg(&self) -> String {
        format!(
            "AdamW | lr {} | {:?} schedule | grad clip {}",
            self.init_lr, self.schedule, self.max_grad_norm
        )
    }
}
