//! Step-doubling error control on top of [`RK4`].
//!
//! Each trial step is integrated once with size `h` and once as two steps of
//! size `h/2`; the scaled difference between the two results is the local
//! error estimate. Steps whose estimate exceeds the tolerance are retried with
//! a smaller `h`, and the estimate of the accepted step sets the next trial
//! size.

use crate::error::{Result, SimulationError};
use crate::solvers::RK4;
use crate::traits::DynamicalSystem;
use log::{trace, warn};
use serde::{Deserialize, Serialize};

/// Controller constants for the adaptive stepper.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorSettings {
    /// Safety factor applied to every step-size prediction.
    pub safety: f64,
    /// Exponent for step growth after an accepted step.
    pub pgrow: f64,
    /// Exponent for step shrinkage after a rejected step.
    pub pshrink: f64,
    /// Error ratio below which the next step is simply quadrupled.
    pub errcon: f64,
    /// Added to every error scale so exactly-zero components never divide by zero.
    pub tiny: f64,
    /// Upper bound on the per-run fractional error tolerance.
    pub max_fractional_error: f64,
    /// Rejected trials allowed within one step before giving up.
    pub max_shrink_attempts: usize,
    /// Smallest step, relative to `max(|t|, 1)`, the shrink loop may reach.
    pub min_step_size_ratio: f64,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        Self {
            safety: 0.9,
            pgrow: -0.20,
            pshrink: -0.25,
            errcon: 6.0e-4,
            tiny: 1.0e-30,
            max_fractional_error: 0.001,
            max_shrink_attempts: 64,
            min_step_size_ratio: f64::EPSILON,
        }
    }
}

impl IntegratorSettings {
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| -> Result<()> {
            Err(SimulationError::InvalidArgument(message.to_string()))
        };
        if !(self.safety > 0.0 && self.safety < 1.0) {
            return invalid("safety factor must lie in (0, 1)");
        }
        if !(self.pgrow < 0.0 && self.pshrink < 0.0) {
            return invalid("pgrow and pshrink must be negative");
        }
        if !(self.errcon > 0.0 && self.errcon < 1.0) {
            return invalid("errcon must lie in (0, 1)");
        }
        if !(self.tiny > 0.0 && self.tiny.is_finite()) {
            return invalid("tiny must be positive and finite");
        }
        if !(self.max_fractional_error > 0.0 && self.max_fractional_error.is_finite()) {
            return invalid("max_fractional_error must be positive and finite");
        }
        if self.max_shrink_attempts == 0 {
            return invalid("max_shrink_attempts must be greater than zero");
        }
        if !(self.min_step_size_ratio >= 0.0 && self.min_step_size_ratio.is_finite()) {
            return invalid("min_step_size_ratio must be non-negative and finite");
        }
        Ok(())
    }
}

/// Outcome of one accepted adaptive step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptedStep {
    /// Time at the end of the accepted step.
    pub time: f64,
    /// Size of the accepted step.
    pub step_size: f64,
    /// Trial size recommended for the following step.
    pub next_step_size: f64,
    /// Scaled error of the accepted step (`<= 1`).
    pub error_ratio: f64,
    /// Number of trials, including the accepted one.
    pub attempts: usize,
}

/// Adaptive RK4 stepper and its scratch pad.
///
/// Owned by exactly one simulation run; `reset` clears and re-sizes every
/// buffer at the start of a run.
pub struct AdaptiveRk4 {
    rk4: RK4,
    y_half: Vec<f64>,
    y_double: Vec<f64>,
    yscale: Vec<f64>,
    dydt: Vec<f64>,
    step_size: f64,
    max_step_size: f64,
    max_fractional_error: f64,
    settings: IntegratorSettings,
}

impl AdaptiveRk4 {
    pub fn new(dim: usize, settings: IntegratorSettings) -> Self {
        Self {
            rk4: RK4::new(dim),
            y_half: vec![0.0; dim],
            y_double: vec![0.0; dim],
            yscale: vec![0.0; dim],
            dydt: vec![0.0; dim],
            step_size: 0.0,
            max_step_size: 0.0,
            max_fractional_error: settings.max_fractional_error,
            settings,
        }
    }

    /// Clears every buffer and prepares a run with the given step bounds and
    /// fractional error tolerance.
    pub fn reset(
        &mut self,
        dim: usize,
        step_size: f64,
        max_step_size: f64,
        max_fractional_error: f64,
    ) {
        self.rk4.reset(dim);
        for buffer in [
            &mut self.y_half,
            &mut self.y_double,
            &mut self.yscale,
            &mut self.dydt,
        ] {
            buffer.clear();
            buffer.resize(dim, 0.0);
        }
        self.step_size = step_size;
        self.max_step_size = max_step_size;
        self.max_fractional_error = max_fractional_error;
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// Per-component error scale of the current step.
    pub fn error_scale(&self) -> &[f64] {
        &self.yscale
    }

    /// Speculative step of size `h` with a step-doubling error estimate.
    ///
    /// The single full step is written to `out`; the return value is
    /// `sum_i |full_i - double_i| / scale_i` against the current error scale.
    pub fn rkqc(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        state: &[f64],
        h: f64,
        out: &mut [f64],
    ) -> f64 {
        self.rk4.step_into(system, t, state, h, out);

        let half = 0.5 * h;
        self.rk4.step_into(system, t, state, half, &mut self.y_half);
        self.rk4
            .step_into(system, t + half, &self.y_half, half, &mut self.y_double);

        out.iter()
            .zip(&self.y_double)
            .zip(&self.yscale)
            .map(|((full, double), scale)| (full - double).abs() / scale)
            .sum()
    }

    /// Takes one error-controlled step from `(t, state)` into `out`.
    ///
    /// Shrinks the trial step until the scaled error is within tolerance, then
    /// records the recommended size of the next trial step, capped at the
    /// run's maximum step size.
    pub fn adaptive_step(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        state: &[f64],
        out: &mut [f64],
    ) -> Result<AcceptedStep> {
        let settings = self.settings;
        let trial = self.step_size;

        system.apply(t, state, &mut self.dydt);
        for i in 0..state.len() {
            self.yscale[i] = state[i].abs() + (self.dydt[i] * trial).abs() + settings.tiny;
        }

        let floor = settings.min_step_size_ratio * t.abs().max(1.0);
        let mut step_size = trial;
        let mut attempts = 0;

        let error_ratio = loop {
            attempts += 1;
            let error = self.rkqc(system, t, state, step_size, out);
            let ratio = error / self.max_fractional_error;
            if !ratio.is_finite() {
                return Err(SimulationError::NonFiniteState { time: t });
            }
            if ratio <= 1.0 {
                break ratio;
            }

            step_size *= settings.safety * ratio.powf(settings.pshrink);
            trace!(
                "rejected step at t = {t}: error ratio {ratio:.3e}, retrying with h = {step_size:e}"
            );
            if attempts >= settings.max_shrink_attempts || !(step_size > floor) {
                warn!(
                    "step size underflow at t = {t} after {attempts} attempts (h = {step_size:e})"
                );
                return Err(SimulationError::StepSizeUnderflow {
                    time: t,
                    step_size,
                    attempts,
                });
            }
        };

        let next_step_size = if error_ratio > settings.errcon {
            settings.safety * step_size * error_ratio.powf(settings.pgrow)
        } else {
            4.0 * step_size
        };
        self.step_size = next_step_size.min(self.max_step_size);

        Ok(AcceptedStep {
            time: t + step_size,
            step_size,
            next_step_size: self.step_size,
            error_ratio,
            attempts,
        })
    }
}
