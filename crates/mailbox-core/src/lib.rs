//! Durable inter-agent mailbox runtime.
//!
//! ```text
//!                  XADD (producer)                 XREADGROUP (consumer)
//!   MailboxService ----------------> inbox stream -----------------> handlers
//!        |                          "{prefix}:{agent}:in"                |
//!        | start()                                                       | XACK
//!        v                                                                v
//!   recovery engine <---- XPENDING / XAUTOCLAIM ---- prior incarnation's PEL
//! ```
//!
//! Every agent owns one inbox stream and one consumer group named after
//! itself; multiple processes for the same agent are distinct consumers
//! within that group, so a crash leaves undelivered work in the group's
//! pending-entries list for the next incarnation's `start()` to recover
//! rather than lose.

pub mod config;
pub mod dispatch;
pub mod message;
pub mod metrics;
pub mod recovery;
pub mod service;
pub mod stream_log;

pub use config::MailboxConfig;
pub use dispatch::Handler;
pub use message::{DEFAULT_MESSAGE_TYPE, MailboxMessage};
pub use recovery::{Callback, RecoveryMetrics};
pub use service::{MailboxService, State};
pub use stream_log::{RedisStreamLog, StreamLog, StreamLogError};

pub use mailbox_common::{MailboxError, Result};
