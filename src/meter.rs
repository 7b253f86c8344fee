//! Household net power: one reading source plus the per-cycle sampler.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{MeterConfig, MeterKind};
use crate::utils::lookup_number;

/// Errors from a single meter reading
#[derive(Debug, Error)]
pub enum MeterError {
    #[error("could not get power data: {0}")]
    Http(#[from] reqwest::Error),
    #[error("could not get power data (error={0})")]
    Status(u16),
    #[error("power field '{0}' missing or not numeric")]
    Field(String),
}

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("no power readings available ({attempts} attempts failed)")]
    NoReadingsAvailable { attempts: u32 },
}

/// Instantaneous net household power in watts: positive draws from the grid,
/// negative exports to it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PowerSource: Send + Sync {
    async fn read_power(&self) -> Result<f64, MeterError>;
}

/// Tasmota smart-meter reader (`status 10` sensor document).
#[derive(Clone)]
pub struct TasmotaMeter {
    status_url: String,
    path: Vec<String>,
    client: reqwest::Client,
}

impl TasmotaMeter {
    pub fn new(cfg: &MeterConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("zeroenergy/", env!("CARGO_PKG_VERSION"))),
        );
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout())
            .default_headers(headers)
            .build()?;
        Ok(Self {
            status_url: format!("{}/cm?cmnd=status%2010", cfg.base_url.trim_end_matches('/')),
            path: cfg.path_segments(),
            client,
        })
    }
}

#[async_trait]
impl PowerSource for TasmotaMeter {
    async fn read_power(&self) -> Result<f64, MeterError> {
        let resp = self.client.get(&self.status_url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(MeterError::Status(status.as_u16()));
        }
        let doc: Value = resp.json().await?;
        lookup_number(&doc, self.path.as_slice()).ok_or_else(|| MeterError::Field(self.path.join(".")))
    }
}

/// Builds the reading source named by the configuration.
pub fn power_source(cfg: &MeterConfig) -> Result<Arc<dyn PowerSource>> {
    match cfg.kind {
        MeterKind::Tasmota => Ok(Arc::new(TasmotaMeter::new(cfg)?)),
    }
}

/// Averages several readings spread evenly over one cycle.
#[derive(Clone)]
pub struct PowerSampler {
    source: Arc<dyn PowerSource>,
}

impl PowerSampler {
    pub fn new(source: Arc<dyn PowerSource>) -> Self {
        Self { source }
    }

    /// Takes `samples` readings `cycle / samples` apart. Failed readings are
    /// logged and left out of the average; if none succeeds, or none is
    /// requested, the cycle fails.
    pub async fn sample(&self, cycle: Duration, samples: u32) -> Result<f64, SampleError> {
        if samples == 0 {
            return Err(SampleError::NoReadingsAvailable { attempts: 0 });
        }
        let spacing = cycle / samples;
        let mut sum = 0.0;
        let mut ok = 0u32;

        for n in 1..=samples {
            match self.source.read_power().await {
                Ok(power_w) => {
                    debug!(sample = n, power_w, "power reading");
                    sum += power_w;
                    ok += 1;
                }
                Err(e) => warn!(sample = n, error = %e, "power reading failed, skipping"),
            }
            sleep(spacing).await;
        }

        if ok == 0 {
            return Err(SampleError::NoReadingsAvailable { attempts: samples });
        }
        Ok(sum / f64::from(ok))
    }
}
