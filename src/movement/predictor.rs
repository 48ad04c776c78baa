//! Movement prediction from recent position samples

use crate::geo::{Coordinate, Corridor};
use crate::node::{MobilityClass, MovementPattern, NodePosition, PositionSample, PredictedLocation};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Samples required before extrapolation is attempted
pub const MIN_SAMPLES_FOR_PREDICTION: usize = 3;

/// Confidence of a prediction that is just the current location
pub const DEGENERATE_CONFIDENCE: f64 = 0.1;

pub const MIN_CONFIDENCE: f64 = 0.1;
pub const MAX_CONFIDENCE: f64 = 0.9;

/// Samples averaged when deriving a movement pattern
const PATTERN_WINDOW: usize = 10;

/// Samples that shape a movement corridor
const CORRIDOR_WINDOW: usize = 5;

/// Corridor buffer never shrinks below this
const MIN_CORRIDOR_RADIUS_M: f64 = 100.0;

/// Result of a movement prediction
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub coordinate: Coordinate,
    pub confidence: f64,
    pub target_time: DateTime<Utc>,

    /// True when history was insufficient and `coordinate` is simply the
    /// current location. Callers must treat it as low-trust.
    pub degenerate: bool,
}

impl From<Prediction> for PredictedLocation {
    fn from(p: Prediction) -> Self {
        PredictedLocation {
            coordinate: p.coordinate,
            confidence: p.confidence,
            target_time: p.target_time,
        }
    }
}

/// Fast movers are predicted less reliably
pub fn confidence_for_speed(average_speed_kmh: f64) -> f64 {
    (MAX_CONFIDENCE - average_speed_kmh.max(0.0) / 100.0).clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}

/// Extrapolate linearly along the two most recent samples.
///
/// `current` is the node's known location, used when history is too short.
/// Returns `None` only when there is no location information at all.
pub fn predict(
    samples: &[PositionSample],
    current: Option<Coordinate>,
    average_speed_kmh: f64,
    horizon: Duration,
    now: DateTime<Utc>,
) -> Option<Prediction> {
    let fallback = current.or_else(|| samples.last().map(|s| s.coordinate))?;
    let degenerate = Prediction {
        coordinate: fallback,
        confidence: DEGENERATE_CONFIDENCE,
        target_time: now,
        degenerate: true,
    };

    if samples.len() < MIN_SAMPLES_FOR_PREDICTION {
        return Some(degenerate);
    }

    let prev = &samples[samples.len() - 2];
    let last = &samples[samples.len() - 1];

    let elapsed_secs = (last.timestamp - prev.timestamp).num_milliseconds() as f64 / 1000.0;
    if elapsed_secs <= 0.0 {
        return Some(degenerate);
    }

    let step_m = prev.coordinate.distance_to(&last.coordinate);
    let velocity_mps = step_m / elapsed_secs;
    let projected = if step_m == 0.0 {
        last.coordinate
    } else {
        let bearing = prev.coordinate.bearing_to(&last.coordinate);
        last.coordinate
            .destination(bearing, velocity_mps * horizon.as_secs_f64())
    };

    let target_time = chrono::Duration::from_std(horizon)
        .map(|h| last.timestamp + h)
        .unwrap_or(last.timestamp);

    Some(Prediction {
        coordinate: projected,
        confidence: confidence_for_speed(average_speed_kmh),
        target_time,
        degenerate: false,
    })
}

/// Average speed over the recent window, in km/h.
///
/// Device-reported speeds win; otherwise speed is derived from the
/// distance covered between consecutive samples.
pub fn average_speed_kmh(samples: &[PositionSample]) -> f64 {
    let window = &samples[samples.len().saturating_sub(PATTERN_WINDOW)..];

    let reported: Vec<f64> = window
        .iter()
        .filter_map(|s| s.speed_kmh)
        .filter(|s| s.is_finite() && *s >= 0.0)
        .collect();
    if !reported.is_empty() {
        return reported.iter().sum::<f64>() / reported.len() as f64;
    }

    let (distance_m, elapsed_secs) = window.windows(2).fold((0.0, 0.0), |(d, t), pair| {
        let dt = (pair[1].timestamp - pair[0].timestamp).num_milliseconds() as f64 / 1000.0;
        if dt <= 0.0 {
            return (d, t);
        }
        (d + pair[0].coordinate.distance_to(&pair[1].coordinate), t + dt)
    });

    if elapsed_secs <= 0.0 {
        0.0
    } else {
        distance_m / elapsed_secs * 3.6
    }
}

/// Recompute the derived movement pattern after a history change
pub fn derive_pattern(position: &NodePosition, horizon: Duration, now: DateTime<Utc>) -> MovementPattern {
    let average_speed = average_speed_kmh(&position.history);
    let predicted = predict(
        &position.history,
        position.current(),
        average_speed,
        horizon,
        now,
    )
    .filter(|p| !p.degenerate)
    .map(PredictedLocation::from);

    MovementPattern {
        average_speed_kmh: average_speed,
        mobility: MobilityClass::from_speed(average_speed),
        predicted,
    }
}

/// Buffered region along the recent trajectory, sized by speed × horizon.
/// Needs at least [`MIN_SAMPLES_FOR_PREDICTION`] samples.
pub fn corridor(
    samples: &[PositionSample],
    average_speed_kmh: f64,
    horizon: Duration,
    now: DateTime<Utc>,
) -> Option<Corridor> {
    if samples.len() < MIN_SAMPLES_FOR_PREDICTION {
        return None;
    }

    let recent = &samples[samples.len().saturating_sub(CORRIDOR_WINDOW)..];
    let mut path: Vec<Coordinate> = recent.iter().map(|s| s.coordinate).collect();

    if let Some(prediction) = predict(samples, None, average_speed_kmh, horizon, now) {
        if !prediction.degenerate {
            path.push(prediction.coordinate);
        }
    }

    let horizon_hours = horizon.as_secs_f64() / 3600.0;
    let radius_m = (average_speed_kmh * 1000.0 * horizon_hours / 2.0).max(MIN_CORRIDOR_RADIUS_M);

    Some(Corridor::new(path, radius_m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::PositionSource;

    fn track(start: Coordinate, step_m: f64, step_secs: i64, n: usize) -> Vec<PositionSample> {
        (0..n)
            .map(|i| PositionSample {
                coordinate: start.destination(90.0, step_m * i as f64),
                timestamp: DateTime::from_timestamp(1_700_000_000 + step_secs * i as i64, 0)
                    .unwrap(),
                accuracy_m: Some(5.0),
                speed_kmh: None,
                heading_deg: None,
                source: PositionSource::Gps,
            })
            .collect()
    }

    #[test]
    fn test_single_sample_is_degenerate() {
        let start = Coordinate::new(45.0, 7.0);
        let samples = track(start, 0.0, 60, 1);
        let now = Utc::now();

        let p = predict(&samples, Some(start), 5.0, Duration::from_secs(600), now).unwrap();
        assert!(p.degenerate);
        assert_eq!(p.confidence, 0.1);
        assert_eq!(p.coordinate, start);
    }

    #[test]
    fn test_no_location_yields_none() {
        let p = predict(&[], None, 0.0, Duration::from_secs(60), Utc::now());
        assert!(p.is_none());
    }

    #[test]
    fn test_linear_extrapolation() {
        let start = Coordinate::new(45.0, 7.0);
        // 100 m east every 60 s
        let samples = track(start, 100.0, 60, 3);
        let p = predict(&samples, None, 6.0, Duration::from_secs(120), Utc::now()).unwrap();

        assert!(!p.degenerate);
        let last = samples[2].coordinate;
        assert!((last.distance_to(&p.coordinate) - 200.0).abs() < 2.0);
        assert!((last.bearing_to(&p.coordinate) - 90.0).abs() < 1.0);
        assert_eq!(p.target_time, samples[2].timestamp + chrono::Duration::seconds(120));
    }

    #[test]
    fn test_confidence_bounds_and_monotonicity() {
        assert_eq!(confidence_for_speed(0.0), 0.9);
        assert_eq!(confidence_for_speed(500.0), 0.1);
        assert!(confidence_for_speed(5.0) > confidence_for_speed(40.0));
    }

    #[test]
    fn test_average_speed_from_positions() {
        // 100 m per 60 s = 6 km/h
        let samples = track(Coordinate::new(45.0, 7.0), 100.0, 60, 4);
        let speed = average_speed_kmh(&samples);
        assert!((speed - 6.0).abs() < 0.1, "speed was {speed}");
    }

    #[test]
    fn test_reported_speed_wins() {
        let mut samples = track(Coordinate::new(45.0, 7.0), 100.0, 60, 3);
        for s in &mut samples {
            s.speed_kmh = Some(30.0);
        }
        assert_eq!(average_speed_kmh(&samples), 30.0);
    }

    #[test]
    fn test_derive_pattern_classifies_walker() {
        let mut position = NodePosition::default();
        for s in track(Coordinate::new(45.0, 7.0), 80.0, 60, 4) {
            position.push_sample(s);
        }
        let pattern = derive_pattern(&position, Duration::from_secs(900), Utc::now());
        assert_eq!(pattern.mobility, MobilityClass::Walking);
        assert!(pattern.predicted.is_some());
    }

    #[test]
    fn test_corridor_requires_history() {
        let samples = track(Coordinate::new(45.0, 7.0), 100.0, 60, 2);
        assert!(corridor(&samples, 6.0, Duration::from_secs(1800), Utc::now()).is_none());
    }

    #[test]
    fn test_corridor_radius_scales_with_speed() {
        let samples = track(Coordinate::new(45.0, 7.0), 100.0, 60, 4);
        let c = corridor(&samples, 6.0, Duration::from_secs(1800), Utc::now()).unwrap();
        // 6 km/h over half an hour, halved
        assert!((c.radius_m - 1_500.0).abs() < 1e-6);
        // recent samples plus the projected point
        assert_eq!(c.path.len(), 5);
    }
}
