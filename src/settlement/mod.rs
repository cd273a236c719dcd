//! Wager settlement: pure evaluation, the engine that drives it, and the
//! recurring jobs that feed the engine.

pub mod engine;
pub mod evaluator;
pub mod jobs;

pub use engine::{EngineSettings, PlaceWagerRequest, SettlementEngine};
