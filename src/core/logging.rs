use std::sync::atomic::{AtomicU64, Ordering};

use super::timestamp::utc_ns_now;

// Correlates log lines emitted from different writer threads.
static LOG_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct LogContext {
    pub component: String,
    pub instance_id: String,
    pub stream: Option<String>,
    pub sequence: u64,
    pub timestamp_ns: u64,
}

impl LogContext {
    pub fn new(component: &str, instance_id: &str) -> Self {
        Self {
            component: component.to_string(),
            instance_id: instance_id.to_string(),
            stream: None,
            sequence: LOG_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp_ns: utc_ns_now(),
        }
    }

    pub fn with_stream(mut self, stream: impl ToString) -> Self {
        self.stream = Some(stream.to_string());
        self
    }

    pub fn format(&self, message: &str) -> String {
        match &self.stream {
            Some(stream) => format!(
                "[seq={:06}][{}:{} {}] {}",
                self.sequence, self.component, self.instance_id, stream, message
            ),
            None => format!(
                "[seq={:06}][{}:{}] {}",
                self.sequence, self.component, self.instance_id, message
            ),
        }
    }
}

/// Uniform log prefixes for long-lived engine components.
pub trait ComponentLogger {
    fn log_context(&self) -> LogContext;

    fn debug(&self, message: &str) {
        log::debug!("{}", self.log_context().format(message));
    }

    fn info(&self, message: &str) {
        log::info!("{}", self.log_context().format(message));
    }

    fn warn(&self, message: &str) {
        log::warn!("{}", self.log_context().format(message));
    }

    fn error(&self, message: &str) {
        log::error!("{}", self.log_context().format(message));
    }
}
