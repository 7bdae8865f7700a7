//! Simulated instruments.
pub mod generic;
pub mod silent;
