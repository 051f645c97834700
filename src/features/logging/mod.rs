use std::time::{Duration, Instant};
use tracing::{error, trace, warn, Level};
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Install the global subscriber. `RUST_LOG` overrides `level`. Returns false if a
/// subscriber was already installed.
pub fn init_logging(level: Level, json_output: bool) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("lightning_txn={},warn", level)));

    if json_output {
        let fmt_layer = fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_thread_names(true);

        Registry::default()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .is_ok()
    } else {
        let fmt_layer = fmt::layer()
            .with_timer(SystemTime)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .with_thread_ids(false)
            .with_thread_names(true);

        Registry::default()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .is_ok()
    }
}

#[macro_export]
macro_rules! log_transaction {
    ($event:expr, $tx_id:expr, $duration:expr) => {
        tracing::info!(
            event = $event,
            tx_id = $tx_id,
            duration_ms = $duration.as_millis() as u64,
            "Transaction event"
        )
    };
}

/// Times one coordination step and logs it on completion; slow steps are
/// reported at warn
pub struct OperationTimer {
    start: Instant,
    operation: &'static str,
    tx_id: String,
    slow_after: Duration,
}

impl OperationTimer {
    pub fn new(operation: &'static str, tx_id: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            operation,
            tx_id: tx_id.into(),
            slow_after: Duration::from_secs(1),
        }
    }

    pub fn with_threshold(mut self, slow_after: Duration) -> Self {
        self.slow_after = slow_after;
        self
    }

    pub fn complete<T>(self, result: &Result<T, crate::core::error::Error>) -> Duration {
        let duration = self.start.elapsed();

        match result {
            Ok(_) if duration > self.slow_after => {
                warn!(
                    operation = self.operation,
                    tx_id = %self.tx_id,
                    duration_ms = duration.as_millis() as u64,
                    "Slow operation detected"
                );
            }
            Ok(_) => {
                trace!(
                    operation = self.operation,
                    tx_id = %self.tx_id,
                    duration_us = duration.as_micros() as u64,
                    "Operation completed"
                );
            }
            Err(e) => {
                error!(
                    operation = self.operation,
                    tx_id = %self.tx_id,
                    duration_us = duration.as_micros() as u64,
                    error = %e,
                    "Operation failed"
                );
            }
        }
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Error;
    use serial_test::serial;

    #[test]
    fn test_operation_timer() {
        let timer = OperationTimer::new("prepare", "tx-1").with_threshold(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        let elapsed = timer.complete::<()>(&Ok(()));
        assert!(elapsed >= Duration::from_millis(5));

        let timer = OperationTimer::new("commit", "tx-2");
        timer.complete::<()>(&Err(Error::TransactionTimeout { id: "tx-2".into() }));
    }

    #[test]
    #[serial]
    fn test_init_logging_only_once() {
        init_logging(Level::DEBUG, false);
        assert!(!init_logging(Level::INFO, true));
    }

    #[test]
    fn test_logging_macros() {
        log_transaction!("commit", "tx-1", Duration::from_millis(50));
    }
}
