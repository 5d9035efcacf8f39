//! Market model: correlation graph and the stochastic tick generator.

pub mod correlation;
pub mod simulator;
