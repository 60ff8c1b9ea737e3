//! Time-course driver for the adaptive integrator.
//!
//! [`DeterministicSimulator::simulate`] integrates a model from `start_time`
//! to `end_time` and samples the requested symbols on an evenly spaced output
//! grid. The same work can be driven incrementally through a
//! [`SimulationRun`], which advances a bounded number of accepted steps per
//! call and reports progress in between.

use crate::adaptive::{AdaptiveRk4, IntegratorSettings};
use crate::controller::SimulationController;
use crate::error::{Result, SimulationError};
use crate::kinetics::ReactionKinetics;
use crate::model::{Model, Symbol};
use crate::symbols::SymbolEvaluator;
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;

/// Sampled trajectory of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationResults {
    pub time_values: Vec<f64>,
    pub symbol_names: Vec<String>,
    /// `symbol_values[s][i]` is symbol `s` at `time_values[i]`.
    pub symbol_values: Vec<Vec<f64>>,
    /// True when the run was cancelled before every output point was reached.
    pub cancelled: bool,
    pub accepted_steps: usize,
}

impl SimulationResults {
    /// Number of recorded output points.
    pub fn len(&self) -> usize {
        self.time_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_values.is_empty()
    }

    pub fn trajectory(&self, name: &str) -> Option<&[f64]> {
        self.symbol_names
            .iter()
            .position(|candidate| candidate == name)
            .map(|idx| self.symbol_values[idx].as_slice())
    }
}

/// Snapshot of a run between batches of steps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunProgress {
    pub done: bool,
    pub cancelled: bool,
    pub time: f64,
    pub samples: usize,
    pub total_samples: usize,
    pub accepted_steps: usize,
}

/// `num_time_points` evenly spaced times from `start_time` to `end_time`,
/// both included.
pub fn prepare_time_grid(start_time: f64, end_time: f64, num_time_points: usize) -> Vec<f64> {
    if num_time_points <= 1 {
        return vec![start_time; num_time_points];
    }
    let delta = (end_time - start_time) / (num_time_points - 1) as f64;
    let mut grid: Vec<f64> = (0..num_time_points)
        .map(|i| start_time + i as f64 * delta)
        .collect();
    if let Some(last) = grid.last_mut() {
        *last = end_time;
    }
    grid
}

/// Deterministic simulator for a reaction network.
///
/// Holds the validated model, the integrator settings and the controller
/// used to cancel or pause runs. Every run gets its own state vector and
/// scratch pad, so one simulator can serve several runs.
pub struct DeterministicSimulator {
    model: Arc<Model>,
    controller: Arc<SimulationController>,
    settings: IntegratorSettings,
}

impl DeterministicSimulator {
    pub fn initialize(
        model: impl Into<Arc<Model>>,
        controller: Arc<SimulationController>,
    ) -> Result<Self> {
        Self::with_settings(model, controller, IntegratorSettings::default())
    }

    pub fn with_settings(
        model: impl Into<Arc<Model>>,
        controller: Arc<SimulationController>,
        settings: IntegratorSettings,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            model: model.into(),
            controller,
            settings,
        })
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Runs a simulation to completion (or cancellation).
    pub fn simulate<S: AsRef<str>>(
        &self,
        start_time: f64,
        end_time: f64,
        num_time_points: usize,
        num_steps: usize,
        requested_symbols: &[S],
    ) -> Result<SimulationResults> {
        self.start(
            start_time,
            end_time,
            num_time_points,
            num_steps,
            requested_symbols,
        )?
        .run_to_end()
    }

    /// Validates the request and prepares a run without taking any steps.
    pub fn start<S: AsRef<str>>(
        &self,
        start_time: f64,
        end_time: f64,
        num_time_points: usize,
        num_steps: usize,
        requested_symbols: &[S],
    ) -> Result<SimulationRun> {
        if num_steps == 0 {
            return Err(SimulationError::InvalidArgument(
                "number of steps must be greater than zero".to_string(),
            ));
        }
        if num_time_points == 0 {
            return Err(SimulationError::InvalidArgument(
                "number of time points must be greater than zero".to_string(),
            ));
        }
        if !start_time.is_finite() || !end_time.is_finite() {
            return Err(SimulationError::InvalidArgument(
                "start and end times must be finite".to_string(),
            ));
        }
        if start_time > end_time {
            return Err(SimulationError::InvalidArgument(
                "end time must not precede start time".to_string(),
            ));
        }

        let mut requested = Vec::with_capacity(requested_symbols.len());
        let mut symbol_names = Vec::with_capacity(requested_symbols.len());
        for name in requested_symbols {
            requested.push(self.model.resolve(name.as_ref())?);
            symbol_names.push(name.as_ref().to_string());
        }

        let num_steps = num_steps.max(num_time_points);
        let max_fractional_error = (1.0 / num_steps as f64).min(self.settings.max_fractional_error);
        let max_step_size = (end_time - start_time) / num_steps as f64;
        let step_size = max_step_size / 5.0;

        debug!(
            "starting run of \"{}\": t = [{start_time}, {end_time}], {num_time_points} points, \
             {num_steps} steps, max step {max_step_size:e}, tolerance {max_fractional_error:e}",
            self.model.name()
        );

        let dim = self.model.num_dynamic_symbols();
        let mut evaluator = SymbolEvaluator::new(Arc::clone(&self.model));
        evaluator.reset(start_time);
        let mut stepper = AdaptiveRk4::new(dim, self.settings);
        stepper.reset(dim, step_size, max_step_size, max_fractional_error);
        // Cancellation and pause only apply to the run they were aimed at.
        self.controller.reset();

        let mut run = SimulationRun {
            kinetics: ReactionKinetics::new(Arc::clone(&self.model)),
            next_values: evaluator.values().to_vec(),
            evaluator,
            stepper,
            controller: Arc::clone(&self.controller),
            grid: prepare_time_grid(start_time, end_time, num_time_points),
            symbol_values: vec![Vec::with_capacity(num_time_points); requested.len()],
            requested,
            symbol_names,
            time_values: Vec::with_capacity(num_time_points),
            accepted_steps: 0,
            done: false,
            cancelled: false,
        };

        // A zero-width interval has nothing to integrate; every output point
        // is the initial state.
        if start_time == end_time {
            run.record_samples(f64::INFINITY);
            run.finish(false);
        }

        Ok(run)
    }
}

/// One simulation in progress. Owns the state vector, the stepper scratch
/// pad and the output buffers.
pub struct SimulationRun {
    kinetics: ReactionKinetics,
    evaluator: SymbolEvaluator,
    stepper: AdaptiveRk4,
    controller: Arc<SimulationController>,
    grid: Vec<f64>,
    requested: Vec<Symbol>,
    symbol_names: Vec<String>,
    time_values: Vec<f64>,
    symbol_values: Vec<Vec<f64>>,
    next_values: Vec<f64>,
    accepted_steps: usize,
    done: bool,
    cancelled: bool,
}

impl SimulationRun {
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Time of the last accepted step.
    pub fn time(&self) -> f64 {
        self.evaluator.time()
    }

    pub fn progress(&self) -> RunProgress {
        RunProgress {
            done: self.done,
            cancelled: self.cancelled,
            time: self.evaluator.time(),
            samples: self.time_values.len(),
            total_samples: self.grid.len(),
            accepted_steps: self.accepted_steps,
        }
    }

    /// Takes up to `batch_size` accepted steps, stopping early when every
    /// output point is recorded or the controller reports cancellation.
    pub fn run_steps(&mut self, batch_size: usize) -> Result<RunProgress> {
        for _ in 0..batch_size {
            if self.done {
                break;
            }

            let time = self.evaluator.time();
            let step = self.stepper.adaptive_step(
                &self.kinetics,
                time,
                self.evaluator.values(),
                &mut self.next_values,
            )?;
            if step.time <= time {
                return Err(SimulationError::StepSizeUnderflow {
                    time,
                    step_size: step.step_size,
                    attempts: step.attempts,
                });
            }
            self.accepted_steps += 1;

            // Samples use the last settled state; the new one is committed after.
            if step.time > self.grid[self.time_values.len()] {
                self.record_samples(step.time);
            }
            self.evaluator.set_values(&self.next_values);
            self.evaluator.set_time(step.time);

            if self.time_values.len() == self.grid.len() {
                self.finish(false);
            } else if self.controller.checkpoint() {
                self.finish(true);
            }
        }
        Ok(self.progress())
    }

    pub fn run_to_end(mut self) -> Result<SimulationResults> {
        while !self.done {
            self.run_steps(usize::MAX)?;
        }
        Ok(self.into_results())
    }

    /// Results recorded so far.
    pub fn results(&self) -> SimulationResults {
        SimulationResults {
            time_values: self.time_values.clone(),
            symbol_names: self.symbol_names.clone(),
            symbol_values: self.symbol_values.clone(),
            cancelled: self.cancelled,
            accepted_steps: self.accepted_steps,
        }
    }

    pub fn into_results(self) -> SimulationResults {
        SimulationResults {
            time_values: self.time_values,
            symbol_names: self.symbol_names,
            symbol_values: self.symbol_values,
            cancelled: self.cancelled,
            accepted_steps: self.accepted_steps,
        }
    }

    // Records every pending grid point strictly before `new_time`.
    fn record_samples(&mut self, new_time: f64) {
        let snapshot: Vec<f64> = self
            .requested
            .iter()
            .map(|&symbol| self.evaluator.evaluate(symbol))
            .collect();

        while let Some(&grid_time) = self.grid.get(self.time_values.len()) {
            if new_time <= grid_time {
                break;
            }
            self.time_values.push(grid_time);
            for (column, &value) in self.symbol_values.iter_mut().zip(&snapshot) {
                column.push(value);
            }
        }

        self.controller
            .set_progress(self.time_values.len() as f64 / self.grid.len() as f64);
    }

    fn finish(&mut self, cancelled: bool) {
        self.done = true;
        self.cancelled = cancelled;
        if cancelled {
            info!(
                "run cancelled at t = {} with {} of {} points recorded",
                self.evaluator.time(),
                self.time_values.len(),
                self.grid.len()
            );
        } else {
            info!(
                "run finished at t = {} after {} accepted steps",
                self.evaluator.time(),
                self.accepted_steps
            );
        }
    }
}
