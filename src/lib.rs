// Public API - data types, probe cycle and export functions
pub mod cli;
pub mod config;
pub mod error;
pub mod export;
pub mod probe;
pub mod state;
pub mod trace;

pub use error::ProbeError;
