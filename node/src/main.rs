//! MDIB Node - hosts a simulated device provider and replicating consumers.
//!
//! The provider commits a few transactions per tick and publishes the
//! resulting reports to every consumer through the dispatcher. When the run
//! ends each consumer replica is compared against the provider.

mod config;
mod device;
mod dispatch;
mod error;

use std::time::Duration;

use chrono::{DateTime, Utc};
use mdib_engine::{ConsumerMdib, DropReason, MdibEvent, ProcessOutcome, Report};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::config::Config;
use crate::device::Device;
use crate::dispatch::{decode, Dispatcher, Frame};
use crate::error::{NodeError, Result};

/// Per-consumer counters.
#[derive(Debug, Default, Clone, Serialize)]
struct ConsumerStats {
    applied: u64,
    buffered: u64,
    stale: u64,
    dropped: u64,
    reloads: u64,
}

/// Summary logged when the run completes.
#[derive(Debug, Serialize)]
struct RunSummary {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    ticks: u64,
    mdib_version: u64,
    sequence_id: String,
    instance_id: Option<u64>,
    consumers: Vec<ConsumerSummary>,
}

#[derive(Debug, Serialize)]
struct ConsumerSummary {
    id: Uuid,
    mdib_version: Option<u64>,
    stats: ConsumerStats,
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mdib_node=debug,mdib_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        consumers = config.consumers,
        ticks = config.ticks,
        tick_ms = config.tick_ms,
        "starting MDIB node"
    );

    run(config).await?;
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let started_at = Utc::now();
    let (device, initial) = Device::build(&config.provider)?;
    let dispatcher = Dispatcher::new_shared();

    let mut tasks = Vec::with_capacity(config.consumers);
    for n in 0..config.consumers {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = dispatcher.register(format!("consumer-{n}"), tx);
        let consumer = ConsumerMdib::new(device.source(), config.consumer.clone());
        tasks.push(tokio::spawn(consume(id, consumer, rx)));
    }
    tracing::info!(subscribers = dispatcher.subscriber_count(), "consumers started");

    if let Some(result) = initial {
        let provider = device.provider();
        dispatcher.publish(&provider.reports_for(&result))?;
    }

    let mut interval = tokio::time::interval(Duration::from_millis(config.tick_ms));
    for tick in 1..=config.ticks {
        interval.tick().await;
        if config.restarts(tick) {
            device.restart()?;
        }

        let provider = device.provider();
        for result in device.tick(tick)? {
            let reports = provider.reports_for(&result);
            dispatcher.publish(&reports)?;
            if config.duplicates(tick) {
                tracing::debug!(tick, reports = reports.len(), "re-publishing reports");
                dispatcher.publish(&reports)?;
            }
        }
    }

    // Closing the queues ends every consumer task once it drained its backlog
    dispatcher.close();

    let provider = device.provider();
    let expected = provider.snapshot();
    let mut consumers = Vec::with_capacity(tasks.len());
    let mut diverged = None;
    for task in tasks {
        let (id, consumer, stats) = task.await?;
        let replica = consumer.export_snapshot();
        match replica {
            Ok(snapshot) if snapshot == expected => {
                tracing::info!(consumer = %id, version = %snapshot.version_group, "replica in sync");
            }
            Ok(snapshot) => {
                tracing::error!(
                    consumer = %id,
                    replica = %snapshot.version_group,
                    provider = %expected.version_group,
                    "replica diverged"
                );
                diverged.get_or_insert(id);
            }
            Err(error) => {
                tracing::error!(consumer = %id, %error, "replica unavailable");
                diverged.get_or_insert(id);
            }
        }
        consumers.push(ConsumerSummary {
            id,
            mdib_version: consumer.mdib_version_group().map(|g| g.mdib_version),
            stats,
        });
    }

    let summary = RunSummary {
        started_at,
        finished_at: Utc::now(),
        ticks: config.ticks,
        mdib_version: expected.version_group.mdib_version,
        sequence_id: expected.version_group.sequence_id.clone(),
        instance_id: expected.version_group.instance_id,
        consumers,
    };
    tracing::info!(summary = %serde_json::to_string(&summary)?, "run complete");

    match diverged {
        Some(consumer) => Err(NodeError::Diverged { consumer }),
        None => Ok(()),
    }
}

/// Replicate from `rx` until the dispatcher closes the queue.
async fn consume(
    id: Uuid,
    consumer: ConsumerMdib,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) -> (Uuid, ConsumerMdib, ConsumerStats) {
    let mut stats = ConsumerStats::default();
    let mut events = consumer.subscribe();
    reload(id, &consumer, &mut stats).await;

    while let Some(frame) = rx.recv().await {
        let report: Report = match decode(&frame) {
            Ok(report) => report,
            Err(error) => {
                tracing::warn!(consumer = %id, %error, "undecodable frame");
                stats.dropped += 1;
                continue;
            }
        };

        match consumer.process_incoming(report) {
            ProcessOutcome::Applied => stats.applied += 1,
            ProcessOutcome::Buffered => stats.buffered += 1,
            ProcessOutcome::Dropped(DropReason::Stale) => stats.stale += 1,
            ProcessOutcome::Dropped(DropReason::SessionReset) => {
                stats.dropped += 1;
                reload(id, &consumer, &mut stats).await;
            }
            ProcessOutcome::Dropped(reason) => {
                stats.dropped += 1;
                tracing::debug!(consumer = %id, ?reason, "report dropped");
            }
        }
        drain_events(id, &mut events);
    }

    tracing::debug!(consumer = %id, ?stats, "queue closed");
    (id, consumer, stats)
}

fn drain_events(id: Uuid, events: &mut broadcast::Receiver<MdibEvent>) {
    loop {
        match events.try_recv() {
            Ok(MdibEvent::SessionReset { local, received }) => {
                tracing::warn!(consumer = %id, %local, %received, "session reset, reloading");
            }
            Ok(event) => tracing::trace!(consumer = %id, ?event, "mdib event"),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                tracing::warn!(consumer = %id, missed, "event receiver lagged");
            }
            Err(_) => break,
        }
    }
}

/// Fetch and load a fresh snapshot on the blocking pool.
async fn reload(id: Uuid, consumer: &ConsumerMdib, stats: &mut ConsumerStats) {
    stats.reloads += 1;
    let consumer = consumer.clone();
    match tokio::task::spawn_blocking(move || consumer.reload_all()).await {
        Ok(Ok(version)) => tracing::info!(consumer = %id, %version, "replica loaded"),
        Ok(Err(error)) => tracing::error!(consumer = %id, %error, "reload failed"),
        Err(error) => tracing::error!(consumer = %id, %error, "reload task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdib_engine::{ConsumerConfig, ProviderConfig};

    #[tokio::test(flavor = "current_thread")]
    async fn reload_loads_the_replica_off_the_runtime() {
        let (device, _) = Device::build(&ProviderConfig::default()).unwrap();
        let consumer = ConsumerMdib::new(device.source(), ConsumerConfig::default());
        let mut stats = ConsumerStats::default();

        reload(Uuid::new_v4(), &consumer, &mut stats).await;

        assert_eq!(stats.reloads, 1);
        assert_eq!(
            consumer.export_snapshot().unwrap(),
            device.provider().snapshot()
        );
    }
}
