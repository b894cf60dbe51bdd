//! Report dispatcher.
//!
//! Tracks subscribed consumers and fans encoded reports out to them. Reports
//! travel as JSON text so every consumer decodes what a remote peer would
//! receive.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mdib_engine::Report;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One encoded report.
pub type Frame = Arc<str>;

/// Sender half of a subscriber's queue.
pub type FrameSender = mpsc::UnboundedSender<Frame>;

/// A single subscriber.
#[derive(Debug)]
pub struct Subscriber {
    pub id: Uuid,
    /// Human-readable name used in logs
    pub label: String,
    pub registered_at: DateTime<Utc>,
    sender: FrameSender,
}

/// Manages subscribers.
///
/// Thread-safe and can be shared across tasks via `Arc`.
#[derive(Debug, Default)]
pub struct Dispatcher {
    subscribers: DashMap<Uuid, Subscriber>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a subscriber and return its id.
    pub fn register(&self, label: impl Into<String>, sender: FrameSender) -> Uuid {
        let id = Uuid::new_v4();
        let subscriber = Subscriber {
            id,
            label: label.into(),
            registered_at: Utc::now(),
            sender,
        };
        tracing::info!(subscriber = %id, label = %subscriber.label, "subscriber registered");
        self.subscribers.insert(id, subscriber);
        id
    }

    pub fn unregister(&self, id: &Uuid) {
        if let Some((_, subscriber)) = self.subscribers.remove(id) {
            tracing::info!(
                subscriber = %id,
                label = %subscriber.label,
                since = %subscriber.registered_at,
                "subscriber unregistered"
            );
        }
    }

    /// Drop every subscriber, closing their queues.
    pub fn close(&self) {
        self.subscribers.clear();
    }

    /// Encode `reports` and send them to every subscriber, in order.
    ///
    /// Subscribers whose queue is closed are removed. Returns the number of
    /// subscribers that received the batch.
    pub fn publish(&self, reports: &[Report]) -> serde_json::Result<usize> {
        let frames = reports
            .iter()
            .map(|report| serde_json::to_string(report).map(Frame::from))
            .collect::<serde_json::Result<Vec<_>>>()?;

        let mut delivered = 0;
        let mut closed = Vec::new();
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if frames
                .iter()
                .all(|frame| subscriber.sender.send(frame.clone()).is_ok())
            {
                delivered += 1;
            } else {
                closed.push(subscriber.id);
            }
        }
        for id in closed {
            self.unregister(&id);
        }

        tracing::debug!(reports = frames.len(), recipients = delivered, "published reports");
        Ok(delivered)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Decode a frame received from the dispatcher.
pub fn decode(frame: &str) -> serde_json::Result<Report> {
    serde_json::from_str(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdib_engine::{
        Category, Descriptor, MdibVersionGroup, MetricSample, MetricValue, NodeType, ReportKind,
        State,
    };

    fn report(version: u64) -> Report {
        let descriptor = Descriptor::new("hr", Some("ch0"), NodeType::NumericMetric);
        let mut state = State::for_descriptor(&descriptor);
        if let Some(metric) = state.metric_mut() {
            metric.value = Some(MetricValue::valid(MetricSample::Numeric(version as f64)));
        }
        Report::states(
            MdibVersionGroup::with_version(version, "urn:uuid:dispatch", None),
            Category::Metric,
            vec![state],
        )
    }

    #[test]
    fn test_register_unregister() {
        let dispatcher = Dispatcher::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let id = dispatcher.register("consumer-1", tx);
        assert_eq!(dispatcher.subscriber_count(), 1);

        dispatcher.unregister(&id);
        assert_eq!(dispatcher.subscriber_count(), 0);
    }

    #[test]
    fn test_publish_reaches_every_subscriber_in_order() {
        let dispatcher = Dispatcher::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        dispatcher.register("a", tx1);
        dispatcher.register("b", tx2);

        let sent = dispatcher.publish(&[report(1), report(2)]).unwrap();
        assert_eq!(sent, 2);

        for rx in [&mut rx1, &mut rx2] {
            let first = decode(&rx.try_recv().unwrap()).unwrap();
            let second = decode(&rx.try_recv().unwrap()).unwrap();
            assert_eq!(first.mdib_version(), 1);
            assert_eq!(second.mdib_version(), 2);
            assert_eq!(first.kind(), ReportKind::EpisodicMetric);
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_closed_subscriber_is_removed() {
        let dispatcher = Dispatcher::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        dispatcher.register("gone", tx1);
        dispatcher.register("alive", tx2);
        drop(rx1);

        assert_eq!(dispatcher.publish(&[report(1)]).unwrap(), 1);
        assert_eq!(dispatcher.subscriber_count(), 1);
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_close_ends_queues() {
        let dispatcher = Dispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register("a", tx);

        dispatcher.close();
        assert_eq!(dispatcher.subscriber_count(), 0);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
