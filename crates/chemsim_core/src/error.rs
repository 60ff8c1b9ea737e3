use thiserror::Error;

/// Failures surfaced by model construction and simulation.
///
/// Configuration problems (`InvalidArgument`, `InvalidModel`, `SymbolNotFound`,
/// `Expression`) are reported before integration starts. `StepSizeUnderflow`
/// and `NonFiniteState` come out of the adaptive stepper. Cancellation is not
/// an error; see `SimulationResults::cancelled`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("expression error: {0}")]
    Expression(String),
    #[error(
        "step size underflow at t = {time} (step size {step_size:e} after {attempts} attempts)"
    )]
    StepSizeUnderflow {
        time: f64,
        step_size: f64,
        attempts: usize,
    },
    #[error("non-finite state encountered at t = {time}")]
    NonFiniteState { time: f64 },
}

pub type Result<T> = std::result::Result<T, SimulationError>;
