pub mod api;
pub mod benchmark;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod lmsr_core;
pub mod market;
pub mod quote;
pub mod reconcile;
pub mod simulation;
pub mod store;
pub mod stress;
pub mod venue;

#[cfg(test)]
mod tests;
