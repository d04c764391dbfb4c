//! Delivery of cycle reports to operators.

use async_trait::async_trait;
use log::{error, info, warn};

use crate::config::Config;
use crate::types::{CycleReport, UpdateOutcome};

pub mod telegram;
pub use telegram::{TelegramClient, TelegramSink};

/// Log target carrying one JSON document per cycle.
pub const REPORT_TARGET: &str = "freshd::report";

/// Somewhere a finished cycle report goes. Delivery problems are the sink's
/// own business and never affect the loop.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish(&self, report: &CycleReport);

    /// A container on `host` was left down. Called as soon as its action
    /// ends, while the rest of the cycle may still be running.
    async fn escalate(&self, _host: &str, _outcome: &UpdateOutcome) {}
}

/// Writes the summary and the machine-readable report to the log.
pub struct LogSink;

#[async_trait]
impl ReportSink for LogSink {
    async fn publish(&self, report: &CycleReport) {
        if report.fatal.is_some() {
            error!("{}", report.summary());
        } else {
            info!("===== Update summary (cycle {}) =====\n{}", report.cycle, report.summary());
        }
        match serde_json::to_string(report) {
            Ok(json) => info!(target: REPORT_TARGET, "{}", json),
            Err(e) => warn!("Failed to serialize report for cycle {}: {}", report.cycle, e),
        }
    }
}

#[derive(Default)]
pub struct Notifier {
    sinks: Vec<Box<dyn ReportSink>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// The log sink, plus Telegram when enabled.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut notifier = Self::new().with_sink(LogSink);
        if config.telegram.enabled {
            let client = TelegramClient::from_config(&config.telegram)?;
            notifier = notifier.with_sink(TelegramSink::new(client));
        }
        Ok(notifier)
    }

    pub async fn publish(&self, report: &CycleReport) {
        for sink in &self.sinks {
            sink.publish(report).await;
        }
    }

    pub async fn escalate(&self, host: &str, outcome: &UpdateOutcome) {
        for sink in &self.sinks {
            sink.escalate(host, outcome).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recording(Arc<Mutex<Vec<u64>>>);

    #[async_trait]
    impl ReportSink for Recording {
        async fn publish(&self, report: &CycleReport) {
            self.0.lock().unwrap().push(report.cycle);
        }
    }

    struct Alerts(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl ReportSink for Alerts {
        async fn publish(&self, _report: &CycleReport) {}

        async fn escalate(&self, host: &str, outcome: &UpdateOutcome) {
            let alert = format!("{}/{}", host, outcome.action.container);
            self.0.lock().unwrap().push(alert);
        }
    }

    fn down(name: &str) -> UpdateOutcome {
        use crate::error::UpdateError;
        use crate::types::{Digest, ImageReference, Stage, UpdateAction};

        let action = UpdateAction {
            container: name.into(),
            container_id: format!("{name}-id"),
            image: ImageReference::parse("nginx:1.27").unwrap(),
            old_digest: Digest::parse("sha256:aaa").unwrap(),
            new_digest: Digest::parse("sha256:bbb").unwrap(),
        };
        let cause = UpdateError::RollbackFailure("previous image is gone".into());
        UpdateOutcome::failed(action, Stage::Starting, cause)
    }

    #[tokio::test]
    async fn escalations_reach_sinks_that_listen_for_them() {
        let alerts = Arc::new(Mutex::new(Vec::new()));
        let cycles = Arc::new(Mutex::new(Vec::new()));
        let notifier = Notifier::new()
            .with_sink(LogSink)
            .with_sink(Recording(Arc::clone(&cycles)))
            .with_sink(Alerts(Arc::clone(&alerts)));

        notifier.escalate("host-a", &down("web")).await;
        assert_eq!(*alerts.lock().unwrap(), vec!["host-a/web".to_string()]);
        assert!(cycles.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publishes_to_every_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let notifier = Notifier::new()
            .with_sink(LogSink)
            .with_sink(Recording(Arc::clone(&seen)))
            .with_sink(Recording(Arc::clone(&seen)));

        notifier.publish(&CycleReport::new(7, "host-a", false)).await;
        assert_eq!(*seen.lock().unwrap(), vec![7, 7]);
    }

    #[test]
    fn telegram_sink_only_when_enabled() {
        let mut config = Config::default();
        assert_eq!(Notifier::from_config(&config).unwrap().sinks.len(), 1);

        config.telegram.enabled = true;
        config.telegram.token = Some("123:abc".into());
        config.telegram.chat_id = Some(42);
        assert_eq!(Notifier::from_config(&config).unwrap().sinks.len(), 2);
    }
}
