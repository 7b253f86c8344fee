use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::watch;

use crate::utils::lookup_number;

/// Battery telemetry decoding errors
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("telemetry payload is not a JSON object")]
    NotAnObject,
}

/// Latest battery state as reported by the battery itself.
///
/// Either field may be unknown; guards that depend on it then stay inactive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatteryTelemetry {
    /// State of charge (%).
    pub soc_percent: Option<f64>,
    /// Battery power on the grid side (W), discharge positive.
    pub grid_power_w: Option<f64>,
    /// When the last message arrived. `None` until the first one.
    pub updated_at: Option<DateTime<Utc>>,
}

impl BatteryTelemetry {
    pub fn is_received(&self) -> bool {
        self.updated_at.is_some()
    }
}

/// Shared holder of the most recent [`BatteryTelemetry`].
///
/// The subscription handler is the only writer. Every update replaces the
/// whole value, so a reader never sees SOC from one message and power from
/// another.
#[derive(Debug, Clone)]
pub struct TelemetryStore {
    tx: Arc<watch::Sender<BatteryTelemetry>>,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BatteryTelemetry::default());
        Self {
            tx: Arc::new(tx),
        }
    }

    pub fn update(&self, soc_percent: Option<f64>, grid_power_w: Option<f64>) {
        self.tx.send_replace(BatteryTelemetry {
            soc_percent,
            grid_power_w,
            updated_at: Some(Utc::now()),
        });
    }

    pub fn read(&self) -> BatteryTelemetry {
        *self.tx.borrow()
    }

    /// Waits until the first message has been stored, at most `timeout`.
    /// Returns whether telemetry is available.
    pub async fn wait_for_first(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let arrived = tokio::time::timeout(timeout, rx.wait_for(BatteryTelemetry::is_received)).await;
        matches!(arrived, Ok(Ok(_)))
    }
}

/// Extracts SOC and grid power from a battery status message.
#[derive(Debug, Clone)]
pub struct TelemetryDecoder {
    soc_path: Vec<String>,
    grid_power_path: Vec<String>,
}

impl TelemetryDecoder {
    /// Field names may be dotted paths into nested objects.
    pub fn new(soc_field: &str, grid_power_field: &str) -> Self {
        let split = |f: &str| f.split('.').map(str::to_string).collect::<Vec<_>>();
        Self {
            soc_path: split(soc_field),
            grid_power_path: split(grid_power_field),
        }
    }

    /// Returns `(soc_percent, grid_power_w)`. A missing or non-numeric
    /// field decodes as unknown rather than failing the whole message.
    pub fn decode(&self, payload: &[u8]) -> Result<(Option<f64>, Option<f64>), TelemetryError> {
        let doc: Value = serde_json::from_slice(payload)?;
        if !doc.is_object() {
            return Err(TelemetryError::NotAnObject);
        }
        let soc = lookup_number(&doc, self.soc_path.as_slice()).map(|s| s.clamp(0.0, 100.0));
        let grid_power = lookup_number(&doc, self.grid_power_path.as_slice());
        Ok((soc, grid_power))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_starts_unknown() {
        let store = TelemetryStore::new();
        let t = store.read();
        assert_eq!(t.soc_percent, None);
        assert_eq!(t.grid_power_w, None);
        assert!(!t.is_received());
    }

    #[test]
    fn test_update_replaces_both_fields() {
        let store = TelemetryStore::new();
        store.update(Some(55.0), Some(-80.0));
        store.update(Some(56.0), None);

        let t = store.read();
        assert_eq!(t.soc_percent, Some(56.0));
        assert_eq!(t.grid_power_w, None);
        assert!(t.is_received());
    }

    #[tokio::test]
    async fn test_wait_for_first_sees_update_from_other_task() {
        let store = TelemetryStore::new();
        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.update(Some(42.0), Some(12.0));
        });

        assert!(store.wait_for_first(Duration::from_secs(5)).await);
        assert_eq!(store.read().soc_percent, Some(42.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_first_times_out() {
        let store = TelemetryStore::new();
        assert!(!store.wait_for_first(Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn test_wait_for_first_returns_immediately_when_present() {
        let store = TelemetryStore::new();
        store.update(None, Some(0.0));
        assert!(store.wait_for_first(Duration::from_millis(1)).await);
    }

    #[test]
    fn test_decode_numbers_and_strings() {
        let decoder = TelemetryDecoder::new("sys_soc", "sys_grid_power");
        let (soc, power) = decoder
            .decode(br#"{"sys_soc": "87", "sys_grid_power": -95.5, "other": 1}"#)
            .unwrap();
        assert_eq!(soc, Some(87.0));
        assert_eq!(power, Some(-95.5));
    }

    #[test]
    fn test_decode_missing_field_is_unknown() {
        let decoder = TelemetryDecoder::new("sys_soc", "sys_grid_power");
        let (soc, power) = decoder.decode(br#"{"sys_soc": 12}"#).unwrap();
        assert_eq!(soc, Some(12.0));
        assert_eq!(power, None);
    }

    #[test]
    fn test_decode_nested_path() {
        let decoder = TelemetryDecoder::new("battery.soc", "battery.power");
        let (soc, power) = decoder
            .decode(br#"{"battery": {"soc": 100.4, "power": 30}}"#)
            .unwrap();
        assert_eq!(soc, Some(100.0));
        assert_eq!(power, Some(30.0));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let decoder = TelemetryDecoder::new("sys_soc", "sys_grid_power");
        assert!(matches!(decoder.decode(b"online"), Err(TelemetryError::Json(_))));
        assert!(matches!(decoder.decode(b"[1,2]"), Err(TelemetryError::NotAnObject)));
    }
}
