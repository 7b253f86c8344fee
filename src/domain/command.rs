use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Actuation errors. None of them stop the control loop.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("no acknowledgement within {0:?}")]
    AckTimeout(Duration),
    #[error("actuation channel closed before acknowledgement")]
    Disconnected,
}

/// Destination of accepted set-points.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Publishes `set_point_w` and returns once it was acknowledged.
    async fn send(&self, set_point_w: f64) -> Result<(), CommandError>;
}

/// Wire representation of a set-point.
///
/// Whole watts go out without a fractional part (`-100`); nudged values keep
/// one decimal (`-100.1`).
pub fn wire_format(set_point_w: f64) -> String {
    if set_point_w.fract() == 0.0 {
        format!("{}", set_point_w as i64)
    } else {
        format!("{:.1}", set_point_w)
    }
}

/// Simulation sink: logs what would have been published.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlySink;

#[async_trait]
impl CommandSink for LogOnlySink {
    async fn send(&self, set_point_w: f64) -> Result<(), CommandError> {
        info!(payload = %wire_format(set_point_w), "simulate: set-point not published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        assert_eq!(wire_format(-100.0), "-100");
        assert_eq!(wire_format(200.0), "200");
        assert_eq!(wire_format(-100.1), "-100.1");
        assert_eq!(wire_format(49.9), "49.9");
        assert_eq!(wire_format(-110.0 - 0.1), "-110.1");
    }

    #[tokio::test]
    async fn test_log_only_sink_accepts_everything() {
        assert!(LogOnlySink.send(-42.0).await.is_ok());
    }
}
