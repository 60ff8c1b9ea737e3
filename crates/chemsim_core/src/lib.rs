//! The `chemsim_core` crate provides the deterministic simulation engine for
//! chemical reaction networks.
//!
//! Key components:
//! - **Model**: Species, parameters, derived expressions and reactions, validated into an
//!   immutable [`model::Model`] with a stoichiometry matrix.
//! - **Equation Engine**: A small bytecode VM for evaluating rate laws and derived expressions.
//! - **Kinetics**: The reaction-network right-hand side, `dx/dt = S * v(t, x)`.
//! - **Solvers**: Clamped RK4 and the step-doubling adaptive controller built on it.
//! - **Simulator**: Time-course driver with grid sampling, cancellation and pause.
pub mod adaptive;
pub mod controller;
pub mod equation_engine;
pub mod error;
pub mod kinetics;
pub mod model;
pub mod simulator;
pub mod solvers;
pub mod symbols;
pub mod traits;

pub use error::{Result, SimulationError};
