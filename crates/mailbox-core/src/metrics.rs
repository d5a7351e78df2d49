/*!
 * Prometheus metrics for the mailbox runtime.
 *
 * Exposed on `/metrics` by `mailbox-cli`; useful for anyone embedding
 * `mailbox-core` directly to wire into their own HTTP server instead.
 */

use lazy_static::lazy_static;
use prometheus::{
    Encoder, IntCounterVec, TextEncoder, opts, register_int_counter_vec,
};

lazy_static! {
    /// Messages successfully appended by `send_message`.
    pub static ref MESSAGES_SENT_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("mailbox_messages_sent_total", "Total number of messages sent"),
        &["recipient"]
    )
    .expect("metric can be created");

    /// Messages recovered by the startup recovery engine.
    pub static ref MESSAGES_RECOVERED_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("mailbox_messages_recovered_total", "Total number of pending messages recovered at startup"),
        &["agent"]
    )
    .expect("metric can be created");

    /// Recovery batches processed (one XAUTOCLAIM round each).
    pub static ref RECOVERY_BATCHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("mailbox_recovery_batches_total", "Total number of recovery batches processed"),
        &["agent"]
    )
    .expect("metric can be created");

    /// Handler failures observed during dispatch (recovery or steady state).
    pub static ref HANDLER_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("mailbox_handler_failures_total", "Total number of handler failures during dispatch"),
        &["agent"]
    )
    .expect("metric can be created");

    /// Consumer loop iteration errors (transient I/O, etc).
    pub static ref CONSUME_LOOP_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("mailbox_consume_loop_errors_total", "Total number of consumer loop errors"),
        &["agent"]
    )
    .expect("metric can be created");
}

/// Render all registered metrics in Prometheus text exposition format.
pub fn render_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
