//! WebAssembly bindings for `chemsim_core`.
//!
//! [`system::WasmSimulator`] runs a whole simulation in one call;
//! [`runner::WasmSimulationRunner`] advances a run in batches so the host can
//! keep its UI responsive and cancel between batches.

pub mod runner;
pub mod system;
