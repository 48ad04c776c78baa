//! Movement Predictor
//!
//! Estimates where a node will be from its recent position samples.
//! Insufficient history degrades to the current location with a fixed low
//! confidence instead of failing.

mod predictor;

pub use predictor::{
    average_speed_kmh, confidence_for_speed, corridor, derive_pattern, predict, Prediction,
    DEGENERATE_CONFIDENCE, MAX_CONFIDENCE, MIN_CONFIDENCE, MIN_SAMPLES_FOR_PREDICTION,
};
