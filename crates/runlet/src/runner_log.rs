//! Tracing layer for the runner process.
//!
//! Ships structured tracing events to the manager as Log frames, preserving
//! severity. Targets under the bridge module stay local: encoding a Log
//! frame emits its own trace events, which would otherwise loop forever.

use tokio::sync::mpsc;
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::protocol::{Frame, Severity};

pub(crate) struct RunnerLogLayer {
    tx: mpsc::UnboundedSender<Frame>,
}

impl RunnerLogLayer {
    pub fn new(tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self { tx }
    }

    fn severity(level: &Level) -> Severity {
        match *level {
            Level::TRACE => Severity::Trace,
            Level::DEBUG => Severity::Debug,
            Level::INFO => Severity::Information,
            Level::WARN => Severity::Warning,
            Level::ERROR => Severity::Error,
        }
    }
}

impl<S> Layer<S> for RunnerLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with("runlet::bridge") {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let _ = self.tx.send(Frame::Log {
            severity: Self::severity(metadata.level()),
            message: visitor.message,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
            if self.message.starts_with('"') && self.message.ends_with('"') {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[tokio::test]
    async fn events_become_log_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = tracing_subscriber::registry().with(RunnerLogLayer::new(tx));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("low disk");
        });

        match rx.recv().await.unwrap() {
            Frame::Log { severity, message } => {
                assert_eq!(severity, Severity::Warning);
                assert_eq!(message, "low disk");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn bridge_targets_are_filtered() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = tracing_subscriber::registry().with(RunnerLogLayer::new(tx));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "runlet::bridge::codec", "encoded frame");
            tracing::info!("visible");
        });

        match rx.recv().await.unwrap() {
            Frame::Log { message, .. } => assert_eq!(message, "visible"),
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
