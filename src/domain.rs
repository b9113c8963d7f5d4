use serde::{Deserialize, Serialize};
use std::fmt;

/// one decoded sensor reading
///
/// immutable once built. `observed_at_ms` is stamped by the hub when the
/// uplink is decoded; the frame carries no device clock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// stable device identifier from the network server (e.g., "eui-a8610a32303f7904")
    pub device_id: String,
    /// temperature in celsius, one decimal of precision
    pub temperature_celsius: f64,
    /// relative humidity (0-100%), half-percent steps
    pub humidity_percent: f64,
    /// battery voltage, absent when the frame does not encode it
    pub battery_volts: Option<f64>,
    /// unix timestamp (ms) of decode
    pub observed_at_ms: u64,
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {:.1} °C, {:.1} %",
            self.device_id, self.temperature_celsius, self.humidity_percent
        )?;
        if let Some(volts) = self.battery_volts {
            write!(f, ", {:.2} V", volts)?;
        }
        Ok(())
    }
}

/// one entry of the device listing
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub device_id: String,
    /// free-form location from config, usually "lat,lon"
    pub location: Option<String>,
    pub latest: Option<Reading>,
}

/// inclusive time window in unix ms; `None` leaves that side open
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct TimeRange {
    #[serde(rename = "from")]
    pub from_ms: Option<u64>,
    #[serde(rename = "to")]
    pub to_ms: Option<u64>,
}

impl TimeRange {
    pub const ALL: TimeRange = TimeRange { from_ms: None, to_ms: None };

    pub fn between(from_ms: u64, to_ms: u64) -> Self {
        Self { from_ms: Some(from_ms), to_ms: Some(to_ms) }
    }

    pub fn contains(&self, ts_ms: u64) -> bool {
        self.from_ms.map_or(true, |from| ts_ms >= from) && self.to_ms.map_or(true, |to| ts_ms <= to)
    }
}

/// wall clock in unix milliseconds
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_bounds_are_inclusive() {
        let range = TimeRange::between(1000, 2000);
        assert!(range.contains(1000));
        assert!(range.contains(2000));
        assert!(!range.contains(999));
        assert!(!range.contains(2001));
        assert!(TimeRange::ALL.contains(0));
        assert!(TimeRange::ALL.contains(u64::MAX));
    }

    #[test]
    fn test_reading_display() {
        let mut reading = Reading {
            device_id: "eui-test".to_string(),
            temperature_celsius: 20.0,
            humidity_percent: 25.0,
            battery_volts: None,
            observed_at_ms: 0,
        };
        assert_eq!(reading.to_string(), "eui-test: 20.0 °C, 25.0 %");

        reading.battery_volts = Some(3.3);
        assert_eq!(reading.to_string(), "eui-test: 20.0 °C, 25.0 %, 3.30 V");
    }

    #[test]
    fn test_timestamp() {
        // should be after 2024
        assert!(now_ms() > 1_700_000_000_000);
    }
}
