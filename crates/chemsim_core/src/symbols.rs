use crate::error::Result;
use crate::model::{Model, Symbol};
use std::cell::RefCell;
use std::sync::Arc;

/// Time-aware view of a model's symbols for one simulation run.
///
/// Holds the authoritative dynamic-symbol vector and simulation time. The
/// stepper evaluates trial times by passing them explicitly to the derivative,
/// so `time` only changes when a step is accepted.
pub struct SymbolEvaluator {
    model: Arc<Model>,
    values: Vec<f64>,
    time: f64,
    // Interior mutability for the VM stack so lookups take `&self`.
    stack: RefCell<Vec<f64>>,
}

impl SymbolEvaluator {
    pub fn new(model: Arc<Model>) -> Self {
        let values = model.initial_values().to_vec();
        Self {
            model,
            values,
            time: 0.0,
            stack: RefCell::new(Vec::with_capacity(64)),
        }
    }

    /// Restores the model's initial values and sets the clock to `start_time`.
    pub fn reset(&mut self, start_time: f64) {
        self.values.clear();
        self.values.extend_from_slice(self.model.initial_values());
        self.time = start_time;
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    /// The dynamic-symbol vector.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn set_values(&mut self, values: &[f64]) {
        self.values.copy_from_slice(values);
    }

    pub fn value(&self, name: &str) -> Result<f64> {
        let symbol = self.model.resolve(name)?;
        Ok(self.evaluate(symbol))
    }

    pub fn evaluate(&self, symbol: Symbol) -> f64 {
        let mut stack = self.stack.borrow_mut();
        self.model.evaluate(symbol, &self.values, self.time, &mut stack)
    }
}
