//! The pending-message recovery engine (spec.md §4.5).
//!
//! Runs exactly once per `start()`, before the consumer loop begins,
//! and takes over any entries a prior incarnation of this agent
//! delivered but never acknowledged.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::MailboxConfig;
use crate::dispatch::{Handler, dispatch};
use crate::message::MailboxMessage;
use crate::metrics;
use crate::stream_log::{StreamLog, StreamLogError};

/// Statistics captured for one recovery run.
#[derive(Debug, Clone, Default)]
pub struct RecoveryMetrics {
    pub total_recovered: usize,
    pub batches_processed: usize,
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
}

impl RecoveryMetrics {
    pub fn elapsed(&self) -> Option<std::time::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }
}

type RecoveryCallback =
    Box<dyn Fn(RecoveryMetrics) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Run the recovery protocol against `log` for `agent_id`'s inbox.
///
/// The short-circuit paths (disabled, no handlers, missing group, empty
/// pending list) all return empty metrics and still invoke `callback`
/// exactly once, per spec.md §4.5 and the "always invoke" resolution of
/// open question O1 in spec.md §9.
pub async fn run_recovery<L: StreamLog + ?Sized>(
    log: &mut L,
    agent_id: &str,
    stream: &str,
    group: &str,
    consumer: &str,
    config: &MailboxConfig,
    handlers: &[Handler],
    callback: Option<&RecoveryCallback>,
) -> RecoveryMetrics {
    let mut metrics = RecoveryMetrics {
        start_time: Some(Instant::now()),
        ..Default::default()
    };

    if !config.enable_recovery {
        info!(agent = agent_id, "pending message recovery is disabled");
        metrics.end_time = Some(Instant::now());
        invoke_callback(callback, metrics.clone()).await;
        return metrics;
    }

    if handlers.is_empty() {
        warn!(
            agent = agent_id,
            "no handlers registered for recovery - pending messages will not be processed"
        );
        metrics.end_time = Some(Instant::now());
        invoke_callback(callback, metrics.clone()).await;
        return metrics;
    }

    match log.xpending_probe(stream, group).await {
        Ok(pending) if pending.is_empty() => {
            info!(agent = agent_id, "no pending messages to recover");
            metrics.end_time = Some(Instant::now());
            invoke_callback(callback, metrics.clone()).await;
            return metrics;
        }
        Ok(_) => {}
        Err(StreamLogError::NoGroup) => {
            debug!(agent = agent_id, "consumer group does not exist yet - skipping recovery");
            metrics.end_time = Some(Instant::now());
            invoke_callback(callback, metrics.clone()).await;
            return metrics;
        }
        Err(err) => {
            warn!(agent = agent_id, error = %err, "failed to check pending messages");
            metrics.end_time = Some(Instant::now());
            invoke_callback(callback, metrics.clone()).await;
            return metrics;
        }
    }

    info!(agent = agent_id, "starting pending message recovery");
    let mut cursor = "0-0".to_string();

    loop {
        let min_idle_ms = config.recovery_min_idle_time_secs * 1000;
        let claim = log
            .xautoclaim(stream, group, consumer, min_idle_ms, &cursor, config.recovery_batch_size)
            .await;

        let (next_cursor, claimed_entries, _deleted) = match claim {
            Ok(triple) => triple,
            Err(err) => {
                warn!(agent = agent_id, error = %err, "error during recovery, stopping early");
                break;
            }
        };

        if claimed_entries.is_empty() {
            if next_cursor == "0-0" {
                debug!(agent = agent_id, "recovery cursor reset to 0-0 with no claims, done");
                break;
            }
            cursor = next_cursor;
            continue;
        }

        debug!(
            agent = agent_id,
            count = claimed_entries.len(),
            next = %next_cursor,
            "recovered batch of pending messages"
        );

        for (entry_id, fields) in &claimed_entries {
            let message = MailboxMessage::decode(fields);
            dispatch(handlers, agent_id, message).await;

            if let Err(err) = log.xack(stream, group, entry_id).await {
                warn!(agent = agent_id, id = %entry_id, error = %err, "failed to ack recovered message");
            }

            metrics.total_recovered += 1;
            metrics::MESSAGES_RECOVERED_TOTAL
                .with_label_values(&[agent_id])
                .inc();
        }

        metrics.batches_processed += 1;
        metrics::RECOVERY_BATCHES_TOTAL
            .with_label_values(&[agent_id])
            .inc();
        cursor = next_cursor;
    }

    metrics.end_time = Some(Instant::now());
    if let Some(elapsed) = metrics.elapsed() {
        info!(
            agent = agent_id,
            recovered = metrics.total_recovered,
            batches = metrics.batches_processed,
            elapsed_secs = elapsed.as_secs_f64(),
            "recovery complete"
        );
    }

    invoke_callback(callback, metrics.clone()).await;
    metrics
}

async fn invoke_callback(callback: Option<&RecoveryCallback>, metrics: RecoveryMetrics) {
    if let Some(callback) = callback {
        callback(metrics).await;
    }
}

pub type Callback = RecoveryCallback;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_log::fake::FakeStreamLog;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn handler_counting(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_msg| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    fn test_config() -> MailboxConfig {
        MailboxConfig {
            recovery_batch_size: 2,
            ..MailboxConfig::default()
        }
    }

    #[tokio::test]
    async fn virgin_agent_yields_zero_recovered_and_no_errors() {
        let mut log = FakeStreamLog::new();
        log.xgroup_create("s", "bob:group").await.ok();
        let counter = Arc::new(AtomicUsize::new(0));
        let handlers = vec![handler_counting(counter)];

        let metrics = run_recovery(
            &mut log,
            "bob",
            "s",
            "bob:group",
            "bob:abc123",
            &test_config(),
            &handlers,
            None,
        )
        .await;

        assert_eq!(metrics.total_recovered, 0);
        assert_eq!(metrics.batches_processed, 0);
    }

    #[tokio::test]
    async fn missing_group_short_circuits_cleanly() {
        let mut log = FakeStreamLog::new();
        let handlers = vec![handler_counting(Arc::new(AtomicUsize::new(0)))];

        let metrics = run_recovery(
            &mut log,
            "bob",
            "nonexistent-stream",
            "bob:group",
            "bob:abc123",
            &test_config(),
            &handlers,
            None,
        )
        .await;

        assert_eq!(metrics.total_recovered, 0);
    }

    #[tokio::test]
    async fn disabled_recovery_still_fires_callback_with_zero_recovered() {
        let mut log = FakeStreamLog::new();
        let config = MailboxConfig {
            enable_recovery: false,
            ..MailboxConfig::default()
        };
        let handlers = vec![handler_counting(Arc::new(AtomicUsize::new(0)))];

        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked2 = invoked.clone();
        let callback: Callback = Box::new(move |m| {
            let invoked2 = invoked2.clone();
            Box::pin(async move {
                assert_eq!(m.total_recovered, 0);
                invoked2.fetch_add(1, Ordering::SeqCst);
            })
        });

        run_recovery(
            &mut log,
            "bob",
            "s",
            "bob:group",
            "bob:abc123",
            &config,
            &handlers,
            Some(&callback),
        )
        .await;

        assert_eq!(invoked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_handlers_skips_dispatch_but_still_calls_back() {
        let mut log = FakeStreamLog::new();
        log.xgroup_create("s", "bob:group").await.ok();
        log.seed("s", vec![("sender".into(), "alice".into())]);
        log.force_deliver_one("s", "bob:group", "bob:old");

        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked2 = invoked.clone();
        let callback: Callback = Box::new(move |_m| {
            let invoked2 = invoked2.clone();
            Box::pin(async move {
                invoked2.fetch_add(1, Ordering::SeqCst);
            })
        });

        let metrics = run_recovery(
            &mut log,
            "bob",
            "s",
            "bob:group",
            "bob:abc123",
            &test_config(),
            &[],
            Some(&callback),
        )
        .await;

        assert_eq!(metrics.total_recovered, 0);
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        // Entry remains pending: it was never dispatched, so it must
        // not have been acked either.
        assert_eq!(log.pending_count("s", "bob:group"), 1);
    }

    #[tokio::test]
    async fn recovers_one_orphaned_entry_and_acks_it() {
        let mut log = FakeStreamLog::new();
        log.xgroup_create("s", "bob:group").await.ok();
        log.seed(
            "s",
            vec![
                ("sender".into(), "alice".into()),
                ("recipient".into(), "bob".into()),
                ("payload".into(), "{\"n\":2}".into()),
            ],
        );
        log.force_deliver_one("s", "bob:group", "bob:old-incarnation");

        let counter = Arc::new(AtomicUsize::new(0));
        let handlers = vec![handler_counting(counter.clone())];

        let metrics = run_recovery(
            &mut log,
            "bob",
            "s",
            "bob:group",
            "bob:new-incarnation",
            &test_config(),
            &handlers,
            None,
        )
        .await;

        assert_eq!(metrics.total_recovered, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(log.pending_count("s", "bob:group"), 0);
    }

    #[tokio::test]
    async fn batch_size_splits_recovery_into_multiple_rounds() {
        let mut log = FakeStreamLog::new();
        log.xgroup_create("s", "bob:group").await.ok();
        for i in 0..5 {
            log.seed("s", vec![("payload".into(), format!("{{\"i\":{i}}}"))]);
        }
        for _ in 0..5 {
            log.force_deliver_one("s", "bob:group", "bob:old");
        }

        let counter = Arc::new(AtomicUsize::new(0));
        let handlers = vec![handler_counting(counter.clone())];
        let config = MailboxConfig {
            recovery_batch_size: 2,
            ..MailboxConfig::default()
        };

        let metrics = run_recovery(
            &mut log, "bob", "s", "bob:group", "bob:new", &config, &handlers, None,
        )
        .await;

        assert_eq!(metrics.total_recovered, 5);
        assert!(metrics.batches_processed == 3, "expected 3 batches of size <=2, got {}", metrics.batches_processed);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn forward_progress_terminates_even_with_empty_batches() {
        let mut log = FakeStreamLog::new();
        log.xgroup_create("s", "bob:group").await.ok();
        log.seed("s", vec![("sender".into(), "alice".into())]);
        log.force_deliver_one("s", "bob:group", "bob:old");

        let handlers = vec![handler_counting(Arc::new(AtomicUsize::new(0)))];
        let metrics = run_recovery(
            &mut log, "bob", "s", "bob:group", "bob:new", &test_config(), &handlers, None,
        )
        .await;

        assert_eq!(metrics.total_recovered, 1);
        assert!(log.xautoclaim_calls < 100, "recovery did not terminate promptly");
    }

    #[tokio::test]
    async fn payload_decodes_through_recovery_path() {
        let mut log = FakeStreamLog::new();
        log.xgroup_create("s", "bob:group").await.ok();
        log.seed(
            "s",
            vec![
                ("sender".into(), "alice".into()),
                ("recipient".into(), "bob".into()),
                ("payload".into(), "{\"n\":1}".into()),
            ],
        );
        log.force_deliver_one("s", "bob:group", "bob:old");

        let received = Arc::new(std::sync::Mutex::new(None));
        let received2 = received.clone();
        let handler: Handler = Arc::new(move |msg| {
            let received2 = received2.clone();
            Box::pin(async move {
                *received2.lock().unwrap() = Some(msg);
                Ok(())
            })
        });

        run_recovery(
            &mut log, "bob", "s", "bob:group", "bob:new", &test_config(), &[handler], None,
        )
        .await;

        let got = received.lock().unwrap().clone().expect("handler should have run");
        assert_eq!(got.sender, "alice");
        assert_eq!(got.recipient, "bob");
        assert_eq!(got.payload.get("n"), Some(&serde_json::Value::from(1)));
    }
}
