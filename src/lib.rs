// Library interface for the AEGIS rules engine
// Shared by the server binary, integration tests and benches

pub mod config;
pub mod rules;
