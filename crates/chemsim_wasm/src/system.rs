//! Core WASM simulator wrapper and shared conversion helpers.

use anyhow::Context;
use chemsim_core::adaptive::IntegratorSettings;
use chemsim_core::controller::SimulationController;
use chemsim_core::model::{Model, ModelDefinition};
use chemsim_core::simulator::DeterministicSimulator;
use js_sys::Array;
use serde_wasm_bindgen::{from_value, to_value};
use std::sync::Arc;
use wasm_bindgen::prelude::*;

pub(crate) fn to_js_error(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{:#}", err))
}

/// Deserializes and validates a model definition passed from JS.
pub(crate) fn build_model(definition: JsValue) -> anyhow::Result<Model> {
    let definition: ModelDefinition = from_value(definition)
        .map_err(|e| anyhow::anyhow!("{}", e))
        .context("Invalid model definition")?;
    definition.build().context("Model validation failed")
}

/// `undefined` or `null` selects the default settings; missing fields take
/// their defaults.
pub(crate) fn parse_settings(settings: JsValue) -> anyhow::Result<IntegratorSettings> {
    if settings.is_undefined() || settings.is_null() {
        return Ok(IntegratorSettings::default());
    }
    from_value(settings)
        .map_err(|e| anyhow::anyhow!("{}", e))
        .context("Invalid integrator settings")
}

#[wasm_bindgen]
pub struct WasmSimulator {
    pub(crate) simulator: DeterministicSimulator,
}

#[wasm_bindgen]
impl WasmSimulator {
    #[wasm_bindgen(constructor)]
    pub fn new(model_definition: JsValue, settings: JsValue) -> Result<WasmSimulator, JsValue> {
        console_error_panic_hook::set_once();

        let model = build_model(model_definition).map_err(to_js_error)?;
        let settings = parse_settings(settings).map_err(to_js_error)?;
        let simulator = DeterministicSimulator::with_settings(
            model,
            Arc::new(SimulationController::new()),
            settings,
        )
        .map_err(|e| JsValue::from_str(&format!("Simulator setup failed: {}", e)))?;

        Ok(WasmSimulator { simulator })
    }

    pub fn species_names(&self) -> Array {
        self.simulator
            .model()
            .dynamic_symbols()
            .iter()
            .map(|name| JsValue::from_str(name))
            .collect()
    }

    pub fn simulate(
        &self,
        start_time: f64,
        end_time: f64,
        num_time_points: u32,
        num_steps: u32,
        symbols: Vec<String>,
    ) -> Result<JsValue, JsValue> {
        let results = self
            .simulator
            .simulate(
                start_time,
                end_time,
                num_time_points as usize,
                num_steps as usize,
                &symbols,
            )
            .map_err(|e| JsValue::from_str(&format!("Simulation failed: {}", e)))?;

        to_value(&results).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::WasmSimulator;
    use chemsim_core::adaptive::IntegratorSettings;
    use chemsim_core::model::{ModelBuilder, ReactionDefinition};
    use serde::Deserialize;
    use serde_wasm_bindgen::{from_value, to_value};
    use wasm_bindgen::JsValue;
    use wasm_bindgen_test::wasm_bindgen_test;

    #[derive(Deserialize)]
    struct ResultsPayload {
        time_values: Vec<f64>,
        symbol_names: Vec<String>,
        symbol_values: Vec<Vec<f64>>,
        cancelled: bool,
    }

    fn decay_definition() -> JsValue {
        let builder = ModelBuilder::new("decay")
            .parameter("k", 0.5)
            .species("A", 4.0)
            .species("B", 0.0)
            .reaction(
                ReactionDefinition::with_expression("decay", "k * A")
                    .reactant("A", 1)
                    .product("B", 1),
            );
        to_value(builder.definition()).expect("definition")
    }

    #[wasm_bindgen_test]
    fn simulate_returns_serialized_results() {
        let simulator = WasmSimulator::new(decay_definition(), JsValue::UNDEFINED).unwrap();
        let value = simulator
            .simulate(0.0, 2.0, 5, 20, vec!["A".to_string(), "B".to_string()])
            .unwrap();
        let results: ResultsPayload = from_value(value).unwrap();
        assert_eq!(results.time_values.len(), 5);
        assert_eq!(results.symbol_names, vec!["A", "B"]);
        assert_eq!(results.symbol_values.len(), 2);
        assert!(!results.cancelled);
        assert_eq!(results.symbol_values[0][0], 4.0);
    }

    #[wasm_bindgen_test]
    fn species_names_lists_dynamic_species() {
        let simulator = WasmSimulator::new(decay_definition(), JsValue::NULL).unwrap();
        let names: Vec<String> = simulator
            .species_names()
            .iter()
            .filter_map(|value| value.as_string())
            .collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[wasm_bindgen_test]
    fn rejects_unknown_symbols() {
        let simulator = WasmSimulator::new(decay_definition(), JsValue::UNDEFINED).unwrap();
        let message = simulator
            .simulate(0.0, 1.0, 2, 2, vec!["Z".to_string()])
            .err()
            .and_then(|err| err.as_string())
            .unwrap_or_default();
        assert!(message.contains("Simulation failed"));
    }

    #[wasm_bindgen_test]
    fn rejects_invalid_settings() {
        let settings = IntegratorSettings {
            safety: 2.0,
            ..IntegratorSettings::default()
        };
        let result = WasmSimulator::new(decay_definition(), to_value(&settings).unwrap());
        assert!(result.is_err(), "safety of 2.0 should be rejected");
    }
}
