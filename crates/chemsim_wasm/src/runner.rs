//! Batched simulation runner for hosts without threads.

use crate::system::{build_model, parse_settings, to_js_error};
use chemsim_core::controller::SimulationController;
use chemsim_core::simulator::{DeterministicSimulator, RunProgress, SimulationRun};
use serde::Serialize;
use serde_wasm_bindgen::to_value;
use std::sync::Arc;
use wasm_bindgen::prelude::*;

/// Progress payload for the stepped simulation runner.
#[derive(Serialize)]
struct SimulationRunProgress {
    done: bool,
    cancelled: bool,
    time: f64,
    samples: usize,
    total_samples: usize,
    accepted_steps: usize,
    fraction: f64,
}

impl From<RunProgress> for SimulationRunProgress {
    fn from(progress: RunProgress) -> Self {
        let fraction = if progress.total_samples == 0 {
            1.0
        } else {
            progress.samples as f64 / progress.total_samples as f64
        };
        Self {
            done: progress.done,
            cancelled: progress.cancelled,
            time: progress.time,
            samples: progress.samples,
            total_samples: progress.total_samples,
            accepted_steps: progress.accepted_steps,
            fraction,
        }
    }
}

#[wasm_bindgen]
pub struct WasmSimulationRunner {
    controller: Arc<SimulationController>,
    run: SimulationRun,
}

#[wasm_bindgen]
impl WasmSimulationRunner {
    #[wasm_bindgen(constructor)]
    pub fn new(
        model_definition: JsValue,
        settings: JsValue,
        start_time: f64,
        end_time: f64,
        num_time_points: u32,
        num_steps: u32,
        symbols: Vec<String>,
    ) -> Result<WasmSimulationRunner, JsValue> {
        console_error_panic_hook::set_once();

        let model = build_model(model_definition).map_err(to_js_error)?;
        let settings = parse_settings(settings).map_err(to_js_error)?;
        let controller = Arc::new(SimulationController::new());
        let simulator =
            DeterministicSimulator::with_settings(model, Arc::clone(&controller), settings)
                .map_err(|e| JsValue::from_str(&format!("Simulator setup failed: {}", e)))?;
        let run = simulator
            .start(
                start_time,
                end_time,
                num_time_points as usize,
                num_steps as usize,
                &symbols,
            )
            .map_err(|e| JsValue::from_str(&format!("Simulation setup failed: {}", e)))?;

        Ok(WasmSimulationRunner { controller, run })
    }

    pub fn is_done(&self) -> bool {
        self.run.is_done()
    }

    pub fn run_steps(&mut self, batch_size: u32) -> Result<JsValue, JsValue> {
        let progress = self
            .run
            .run_steps(batch_size as usize)
            .map_err(|e| JsValue::from_str(&format!("Simulation failed: {}", e)))?;

        to_value(&SimulationRunProgress::from(progress))
            .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    pub fn get_progress(&self) -> Result<JsValue, JsValue> {
        to_value(&SimulationRunProgress::from(self.run.progress()))
            .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    /// Results recorded so far; partial until the run is done.
    pub fn get_result(&self) -> Result<JsValue, JsValue> {
        to_value(&self.run.results())
            .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    /// Takes effect at the next accepted step.
    pub fn cancel(&self) {
        self.controller.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::WasmSimulationRunner;
    use chemsim_core::model::{ModelBuilder, ReactionDefinition};
    use serde::Deserialize;
    use serde_wasm_bindgen::{from_value, to_value};
    use wasm_bindgen::JsValue;
    use wasm_bindgen_test::wasm_bindgen_test;

    #[derive(Deserialize)]
    struct ProgressPayload {
        done: bool,
        cancelled: bool,
        samples: usize,
        total_samples: usize,
    }

    #[derive(Deserialize)]
    struct ResultsPayload {
        time_values: Vec<f64>,
        cancelled: bool,
    }

    fn runner(symbols: &[&str]) -> Result<WasmSimulationRunner, JsValue> {
        let builder = ModelBuilder::new("decay")
            .species("A", 1.0)
            .species("B", 0.0)
            .reaction(
                ReactionDefinition::mass_action("decay", 0.2)
                    .reactant("A", 1)
                    .product("B", 1),
            );
        WasmSimulationRunner::new(
            to_value(builder.definition()).expect("definition"),
            JsValue::UNDEFINED,
            0.0,
            10.0,
            6,
            60,
            symbols.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[wasm_bindgen_test]
    fn runner_completes_in_batches() {
        let mut runner = runner(&["A", "B"]).unwrap();
        let mut batches = 0;
        while !runner.is_done() {
            runner.run_steps(5).unwrap();
            batches += 1;
        }
        assert!(batches > 1);

        let progress: ProgressPayload = from_value(runner.get_progress().unwrap()).unwrap();
        assert!(progress.done);
        assert_eq!(progress.samples, progress.total_samples);

        let results: ResultsPayload = from_value(runner.get_result().unwrap()).unwrap();
        assert_eq!(results.time_values.len(), 6);
        assert!(!results.cancelled);
    }

    #[wasm_bindgen_test]
    fn reports_progress_before_the_first_batch() {
        let runner = runner(&["A"]).unwrap();
        assert!(!runner.is_done());
        let progress: ProgressPayload = from_value(runner.get_progress().unwrap()).unwrap();
        assert!(!progress.done);
        assert_eq!(progress.samples, 0);
        assert_eq!(progress.total_samples, 6);
        let results: ResultsPayload = from_value(runner.get_result().unwrap()).unwrap();
        assert!(results.time_values.is_empty());
    }

    #[wasm_bindgen_test]
    fn cancel_stops_the_next_batch() {
        let mut runner = runner(&["A"]).unwrap();
        runner.run_steps(1).unwrap();
        runner.cancel();
        let progress: ProgressPayload = from_value(runner.run_steps(1000).unwrap()).unwrap();
        assert!(progress.done);
        assert!(progress.cancelled);
        assert!(progress.samples < progress.total_samples);
        assert!(runner.is_done());
    }

    #[wasm_bindgen_test]
    fn rejects_unknown_symbols() {
        let message = runner(&["missing"])
            .err()
            .and_then(|err| err.as_string())
            .unwrap_or_default();
        assert!(message.contains("Simulation setup failed"));
    }
}
