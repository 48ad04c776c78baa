//! Partial updates and eligibility filters for node records

use crate::geo::{BoundingBox, Coordinate};
use crate::message::Priority;
use crate::node::error::{NodeError, NodeResult};
use crate::node::types::{Node, RelayProtocol, ScanMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Explicit partial update; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeUpdate {
    pub device_name: Option<String>,
    pub battery_level: Option<u8>,
    pub is_scanning: Option<bool>,
    pub scan_mode: Option<ScanMode>,
    pub internet_connected: Option<bool>,
    pub allows_forwarding: Option<bool>,
    pub max_forwarding_distance_m: Option<f64>,
    pub max_daily_forwards: Option<u32>,
    pub max_hourly_forwards: Option<u32>,
    pub signal_strength: Option<f64>,
    pub supported_protocols: Option<Vec<RelayProtocol>>,
    pub location: Option<Coordinate>,
}

impl NodeUpdate {
    pub fn validate(&self) -> NodeResult<()> {
        if let Some(name) = &self.device_name {
            if name.trim().is_empty() {
                return Err(NodeError::InvalidUpdate("device name is empty".into()));
            }
        }
        if let Some(battery) = self.battery_level {
            if battery > 100 {
                return Err(NodeError::InvalidUpdate(format!(
                    "battery level {battery} exceeds 100"
                )));
            }
        }
        if let Some(signal) = self.signal_strength {
            if !(0.0..=1.0).contains(&signal) {
                return Err(NodeError::InvalidUpdate(format!(
                    "signal strength {signal} outside [0, 1]"
                )));
            }
        }
        if let Some(distance) = self.max_forwarding_distance_m {
            if !distance.is_finite() || distance <= 0.0 {
                return Err(NodeError::InvalidUpdate(
                    "max forwarding distance must be positive".into(),
                ));
            }
        }
        if let Some(protocols) = &self.supported_protocols {
            if protocols.is_empty() {
                return Err(NodeError::InvalidUpdate(
                    "at least one relay protocol is required".into(),
                ));
            }
        }
        if let Some(location) = &self.location {
            location
                .validate()
                .map_err(|e| NodeError::InvalidUpdate(e.to_string()))?;
        }
        Ok(())
    }

    /// Apply to a record; a status report also proves the node is alive
    pub fn apply(&self, node: &mut Node, now: DateTime<Utc>) {
        if let Some(name) = &self.device_name {
            node.device_name = name.clone();
        }
        if let Some(battery) = self.battery_level {
            node.capability.battery_level = Some(battery);
        }
        if let Some(scanning) = self.is_scanning {
            node.capability.is_scanning = scanning;
        }
        if let Some(mode) = self.scan_mode {
            node.capability.scan_mode = mode;
        }
        if let Some(internet) = self.internet_connected {
            node.connectivity.internet_connected = internet;
        }
        if let Some(allows) = self.allows_forwarding {
            node.forwarding.allows_forwarding = allows;
        }
        if let Some(distance) = self.max_forwarding_distance_m {
            node.forwarding.max_forwarding_distance_m = distance;
        }
        if let Some(max) = self.max_daily_forwards {
            node.forwarding.max_daily_forwards = max;
        }
        if let Some(max) = self.max_hourly_forwards {
            node.forwarding.max_hourly_forwards = max;
        }
        if let Some(signal) = self.signal_strength {
            node.capability.signal_strength = Some(signal);
        }
        if let Some(protocols) = &self.supported_protocols {
            node.capability.supported_protocols = protocols.clone();
        }
        if let Some(location) = self.location {
            node.position.location = Some(location);
        }

        node.connectivity.last_seen = now;
        node.connectivity.is_active = true;
    }
}

/// Which nodes a registry lookup should return
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EligibilityFilter {
    pub require_active: bool,
    pub require_scanning: bool,
    pub require_forwarding: bool,
    pub require_internet: bool,

    /// Only nodes with daily and hourly forwards left
    pub require_quota: bool,
    pub min_battery: Option<u8>,

    /// Proximity constraint: nodes within `max_distance_m` of `near`
    pub near: Option<Coordinate>,
    pub max_distance_m: Option<f64>,

    /// Area constraint, used for corridor searches
    pub inside: Option<BoundingBox>,

    /// Only nodes seen within this window
    pub seen_within: Option<Duration>,

    pub limit: Option<usize>,
}

impl EligibilityFilter {
    /// Active, scanning, forwarding-enabled nodes
    pub fn relay_candidates() -> Self {
        Self {
            require_active: true,
            require_scanning: true,
            require_forwarding: true,
            ..Default::default()
        }
    }

    pub fn within(mut self, near: Coordinate, max_distance_m: f64) -> Self {
        self.near = Some(near);
        self.max_distance_m = Some(max_distance_m);
        self
    }

    pub fn inside(mut self, area: BoundingBox) -> Self {
        self.inside = Some(area);
        self
    }

    pub fn min_battery(mut self, min: u8) -> Self {
        self.min_battery = Some(min);
        self
    }

    pub fn seen_within(mut self, window: Duration) -> Self {
        self.seen_within = Some(window);
        self
    }

    /// Skip nodes at their forward caps unless `priority` bypasses them
    pub fn with_quota_for(mut self, priority: Priority) -> Self {
        self.require_quota = priority != Priority::Emergency;
        self
    }

    pub fn with_internet(mut self) -> Self {
        self.require_internet = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Full predicate; the store evaluates the indexable part in SQL and
    /// this check covers the rest (exact great-circle radius).
    pub fn matches(&self, node: &Node, now: DateTime<Utc>) -> bool {
        if self.require_active && !node.connectivity.is_active {
            return false;
        }
        if self.require_scanning && !node.capability.is_scanning {
            return false;
        }
        if self.require_forwarding && !node.forwarding.allows_forwarding {
            return false;
        }
        if self.require_internet && !node.connectivity.internet_connected {
            return false;
        }
        if self.require_quota {
            let f = &node.forwarding;
            if f.current_daily_forwards >= f.max_daily_forwards
                || f.current_hourly_forwards >= f.max_hourly_forwards
            {
                return false;
            }
        }
        if let Some(min) = self.min_battery {
            // unknown battery is not excluded
            if matches!(node.capability.battery_level, Some(b) if b < min) {
                return false;
            }
        }
        if let Some(window) = self.seen_within {
            if !node.seen_within(window, now) {
                return false;
            }
        }
        if let (Some(near), Some(max)) = (self.near, self.max_distance_m) {
            match node.position.location {
                Some(location) if location.distance_to(&near) <= max => {}
                _ => return false,
            }
        }
        if let Some(area) = &self.inside {
            match node.position.location {
                Some(location) if area.contains(&location) => {}
                _ => return false,
            }
        }
        true
    }

    /// Box the store can prefilter on, if the filter is spatial
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let around = match (self.near, self.max_distance_m) {
            (Some(near), Some(max)) => Some(BoundingBox::around(&near, max)),
            _ => None,
        };
        match (around, self.inside) {
            (Some(a), Some(b)) => Some(BoundingBox {
                min_lat: a.min_lat.max(b.min_lat),
                max_lat: a.max_lat.min(b.max_lat),
                min_lon: a.min_lon.max(b.min_lon),
                max_lon: a.max_lon.min(b.max_lon),
            }),
            (a, b) => a.or(b),
        }
    }
}
