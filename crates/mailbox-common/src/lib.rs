//! # Mailbox Common
//!
//! Shared error types and logging setup used by `mailbox-core` and
//! `mailbox-cli`.

pub mod error;
pub mod logging;

pub use error::{MailboxError, Result, classify_connect_error, is_busygroup, is_nogroup};
pub use logging::init_tracing;
