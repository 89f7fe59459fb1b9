//! Position tracking module

pub mod tracker;

pub use tracker::{Position, PositionDrift, PositionTracker};
