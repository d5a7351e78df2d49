//! `MailboxService`: the lifecycle, producer and consumer-loop surface
//! that application code actually holds (spec.md §4.3, §4.4, §4.6).
//!
//! Wires together `MailboxConfig`, a `StreamLog`, the handler registry,
//! and the recovery engine. Mirrors `message-processor`'s split between
//! a shared `Arc<Mutex<StreamConsumer>>` and a detached consumer task:
//! the connection is shared between `send_message` (called from
//! whatever task holds the service) and the background consume loop,
//! guarded by a `tokio::sync::Mutex` rather than threads contending for
//! a std one, since every access point is async.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use mailbox_common::{MailboxError, Result};
use crate::config::MailboxConfig;
use crate::dispatch::{Handler, dispatch};
use crate::message::MailboxMessage;
use crate::metrics;
use crate::recovery::{self, Callback};
use crate::stream_log::{RedisStreamLog, StreamLog, StreamLogError};

/// Lifecycle state, per spec.md §4.4: a service moves `New` → `Running`
/// → `Stopped` and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Running,
    Stopped,
}

/// A durable per-agent mailbox: one inbox stream, one consumer group
/// named after the agent, and a uniquely-named consumer within that
/// group so a crashed-and-restarted incarnation never collides with
/// one still running.
pub struct MailboxService {
    agent_id: String,
    config: MailboxConfig,
    log: Arc<Mutex<Box<dyn StreamLog + Send>>>,
    handlers: Vec<Handler>,
    recovery_callback: Option<Callback>,
    consumer_group: String,
    consumer_name: String,
    state: State,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl MailboxService {
    /// Build a service backed by a real Redis-streams log server.
    pub fn new(agent_id: impl Into<String>, config: MailboxConfig) -> Self {
        let redis_url = config.redis_url();
        Self::with_log(agent_id, config, Box::new(RedisStreamLog::new(redis_url)))
    }

    /// Build a service against an arbitrary `StreamLog`. The seam tests
    /// use to swap in `FakeStreamLog`.
    pub fn with_log(agent_id: impl Into<String>, config: MailboxConfig, log: Box<dyn StreamLog + Send>) -> Self {
        let agent_id = agent_id.into();
        let consumer_group = format!("{agent_id}:group");
        let consumer_name = format!("{agent_id}:{:06x}", rand::thread_rng().gen_range(0..0xFFFFFF_u32));

        Self {
            agent_id,
            config,
            log: Arc::new(Mutex::new(log)),
            handlers: Vec::new(),
            recovery_callback: None,
            consumer_group,
            consumer_name,
            state: State::New,
            running: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The inbox stream key this agent reads from and that peers write
    /// to: `{stream_prefix}:{agent_id}:in`.
    pub fn inbox_stream(&self) -> String {
        format!("{}:{}:in", self.config.stream_prefix, self.agent_id)
    }

    /// Register a handler to run on every delivered message, in
    /// registration order. Safe to call before or after `start()`, but
    /// the running consumer loop dispatches against a snapshot of the
    /// handler list taken at `start()` time (spec.md §4.4: "read-only
    /// while dispatch is in progress") — a handler registered after
    /// `start()` has already been called never reaches that loop.
    /// Register all handlers before calling `start()` to guarantee they
    /// run; call `stop()` and `start()` again to pick up new ones.
    pub fn register_handler(&mut self, handler: Handler) {
        self.handlers.push(handler);
    }

    /// Install a callback to be invoked once recovery completes (or
    /// short-circuits), receiving `RecoveryMetrics`.
    pub fn set_recovery_callback(&mut self, callback: Callback) {
        self.recovery_callback = Some(callback);
    }

    /// Start the service: ensure the connection and consumer group
    /// exist, run recovery, then spawn the background consumer loop.
    ///
    /// Idempotent against a transport-level `BUSYGROUP`: a group that
    /// already exists (this agent's own prior incarnation, or a
    /// concurrent `start()` racing this one) is not an error.
    pub async fn start(&mut self) -> Result<()> {
        let stream = self.inbox_stream();

        {
            let mut log = self.log.lock().await;
            log.ping().await.map_err(MailboxError::from)?;
            match log.xgroup_create(&stream, &self.consumer_group).await {
                Ok(()) | Err(StreamLogError::BusyGroup) => {}
                Err(err) => return Err(err.into()),
            }
        }

        if self.config.enable_recovery {
            info!(agent = %self.agent_id, "running pending message recovery before accepting new work");
        }
        let mut log = self.log.lock().await;
        recovery::run_recovery(
            &mut **log,
            &self.agent_id,
            &stream,
            &self.consumer_group,
            &self.consumer_name,
            &self.config,
            &self.handlers,
            self.recovery_callback.as_ref(),
        )
        .await;
        drop(log);

        self.running.store(true, Ordering::SeqCst);
        let task = tokio::spawn(consume_loop(
            self.log.clone(),
            self.agent_id.clone(),
            stream,
            self.consumer_group.clone(),
            self.consumer_name.clone(),
            self.config.poll_interval_secs,
            self.handlers.clone(),
            self.running.clone(),
        ));
        self.task = Some(task);
        self.state = State::Running;
        info!(agent = %self.agent_id, consumer = %self.consumer_name, "mailbox service started");
        Ok(())
    }

    /// Stop the service: signal the consumer loop to exit, wait for it,
    /// and close the underlying connection. Idempotent; calling `stop`
    /// on a service that was never started, or was already stopped, is
    /// a no-op.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.log.lock().await.close().await;
        self.state = State::Stopped;
        info!(agent = %self.agent_id, "mailbox service stopped");
    }

    /// Send a message to `recipient`'s inbox. Does not require `start`
    /// — producing is independent of this agent consuming its own
    /// mailbox (spec.md §4.3).
    pub async fn send_message(
        &self,
        recipient: impl Into<String>,
        payload: Map<String, Value>,
        message_type: Option<String>,
        message_id: Option<String>,
    ) -> Result<String> {
        let recipient = recipient.into();
        let message = MailboxMessage::new(self.agent_id.clone(), recipient.clone(), payload, message_type, message_id);
        let stream = format!("{}:{}:in", self.config.stream_prefix, recipient);

        let mut log = self.log.lock().await;
        log.xadd(&stream, &message.encode(), self.config.max_stream_length)
            .await
            .map_err(MailboxError::from)?;
        drop(log);

        metrics::MESSAGES_SENT_TOTAL.with_label_values(&[&recipient]).inc();
        debug!(agent = %self.agent_id, recipient = %recipient, message_id = %message.message_id, "message sent");
        Ok(message.message_id)
    }
}

/// The steady-state consumer loop: block for new entries, dispatch each
/// to the handler snapshot, ack. Runs detached from `MailboxService`
/// until `running` flips false or the task is aborted.
///
/// Aborting via `JoinHandle::abort` rather than propagating a Rust
/// analogue of `asyncio.CancelledError` is the idiomatic substitute for
/// the source's cooperative-cancellation shutdown: `XREADGROUP`'s
/// `BLOCK` window bounds how long a stuck loop can ignore the `running`
/// flag, and `abort` is the backstop if it's blocked somewhere else.
#[allow(clippy::too_many_arguments)]
async fn consume_loop(
    log: Arc<Mutex<Box<dyn StreamLog + Send>>>,
    agent_id: String,
    stream: String,
    group: String,
    consumer: String,
    poll_interval_secs: f64,
    handlers: Vec<Handler>,
    running: Arc<AtomicBool>,
) {
    let block_ms = (poll_interval_secs.max(0.0) * 1000.0) as usize;

    while running.load(Ordering::SeqCst) {
        let read = {
            let mut log = log.lock().await;
            log.xreadgroup(&stream, &group, &consumer, 10, block_ms).await
        };

        match read {
            Ok(entries) if entries.is_empty() => {
                // A real log server already blocked for up to `block_ms`
                // inside `xreadgroup`; this yield just keeps a fake or
                // non-blocking implementation from spinning the executor.
                tokio::task::yield_now().await;
            }
            Ok(entries) => {
                for (entry_id, fields) in entries {
                    let message = MailboxMessage::decode(&fields);
                    dispatch(&handlers, &agent_id, message).await;

                    let mut log = log.lock().await;
                    if let Err(err) = log.xack(&stream, &group, &entry_id).await {
                        warn!(agent = %agent_id, id = %entry_id, error = %err, "failed to ack delivered message");
                    }
                }
            }
            Err(err) => {
                error!(agent = %agent_id, error = %err, "consumer loop read failed");
                metrics::CONSUME_LOOP_ERRORS_TOTAL.with_label_values(&[&agent_id]).inc();
                tokio::time::sleep(Duration::from_secs_f64(poll_interval_secs)).await;
            }
        }
    }
}
