//! Handler registry type and the fan-out (dispatch) contract shared by
//! the consumer loop and the recovery engine.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{error, info};

use crate::message::MailboxMessage;
use crate::metrics;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered message handler. Returns `Err` to signal a failure the
/// dispatch loop should log and move past — Rust has no exceptions, so
/// this is the equivalent of the source's "handler raised" path.
///
/// Boxed as `Arc` rather than `Box` so the handler list can be cheaply
/// cloned into a snapshot before a dispatch begins (spec.md §4.4: "the
/// list is read-only while dispatch is in progress").
pub type Handler = Arc<dyn Fn(MailboxMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Await every handler in `handlers`, in registration order, on
/// `message`.
///
/// Implements spec.md §4.7 exactly: an empty handler list logs at info
/// and returns; otherwise each handler is awaited in turn and any `Err`
/// it returns is logged and suppressed so the remaining handlers still
/// run. Dispatch completes once every handler has returned or erred —
/// this is the contract invariant I2 relies on: ack always follows
/// dispatch, regardless of handler outcome.
pub async fn dispatch(handlers: &[Handler], agent_id: &str, message: MailboxMessage) {
    if handlers.is_empty() {
        info!(
            agent = agent_id,
            message_id = %message.message_id,
            "mailbox message received with no handlers registered"
        );
        return;
    }

    for handler in handlers {
        if let Err(err) = handler(message.clone()).await {
            error!(
                agent = agent_id,
                message_id = %message.message_id,
                error = %err,
                "mailbox handler failed"
            );
            metrics::HANDLER_FAILURES_TOTAL
                .with_label_values(&[agent_id])
                .inc();
        }
    }
}
