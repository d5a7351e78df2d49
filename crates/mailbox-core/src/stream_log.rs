//! The log-server contract (spec.md §6) and its Redis-backed
//! implementation.
//!
//! `StreamLog` captures exactly the seven operations the mailbox needs:
//! `ping`, `xadd`, `xgroup_create`, `xreadgroup`, `xack`,
//! `xpending_probe` and `xautoclaim`. Routing every Redis interaction
//! through this trait lets the recovery engine and consumer loop be
//! unit tested against an in-memory fake instead of a live server,
//! while `RedisStreamLog` speaks the real wire protocol the way
//! `message-processor/src/consumer.rs` does — parsing `redis::Value`
//! directly rather than relying on typed response structs, since
//! `XAUTOCLAIM`'s reply shape isn't covered by the `redis` crate's
//! higher-level helpers.

use async_trait::async_trait;
use mailbox_common::MailboxError;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Value};
use thiserror::Error;
use tracing::info;

/// One claimed or freshly-read stream entry: its opaque id plus its raw
/// field map.
pub type RawEntry = (String, Vec<(String, Vec<u8>)>);

/// Errors a `StreamLog` operation can raise.
///
/// `BusyGroup` and `NoGroup` are pulled out as distinct variants rather
/// than folded into `Other` because the caller's disposition for each
/// differs (spec.md §7): `BusyGroup` is absorbed as success by `start`,
/// `NoGroup` short-circuits recovery.
#[derive(Debug, Error)]
pub enum StreamLogError {
    #[error("consumer group already exists")]
    BusyGroup,
    #[error("consumer group does not exist")]
    NoGroup,
    #[error(transparent)]
    Other(#[from] MailboxError),
}

pub type StreamResult<T> = std::result::Result<T, StreamLogError>;

/// The log-server operations the mailbox runtime depends on.
#[async_trait]
pub trait StreamLog: Send {
    /// Verify the connection is live and authenticated.
    async fn ping(&mut self) -> StreamResult<()>;

    /// `XADD key MAXLEN ~ maxlen * field value ...`
    async fn xadd(
        &mut self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: usize,
    ) -> StreamResult<String>;

    /// `XGROUP CREATE stream group 0 MKSTREAM`. Returns `BusyGroup`
    /// rather than success when the group already exists; callers
    /// absorb that per spec.md §4.4 step 2.
    async fn xgroup_create(&mut self, stream: &str, group: &str) -> StreamResult<()>;

    /// `XREADGROUP GROUP group consumer BLOCK block_ms COUNT count STREAMS stream >`
    async fn xreadgroup(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> StreamResult<Vec<RawEntry>>;

    /// `XACK stream group id`
    async fn xack(&mut self, stream: &str, group: &str, id: &str) -> StreamResult<()>;

    /// `XPENDING stream group - + 1`. Returns the ids of entries found
    /// (0 or 1, since `count` is pinned to 1 — this is a probe, not a
    /// full listing). `NoGroup` when the group doesn't exist yet.
    async fn xpending_probe(&mut self, stream: &str, group: &str) -> StreamResult<Vec<String>>;

    /// `XAUTOCLAIM stream group consumer min_idle_ms start COUNT count`.
    /// Returns `(next_cursor, claimed_entries, deleted_ids)`.
    #[allow(clippy::too_many_arguments)]
    async fn xautoclaim(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        start: &str,
        count: usize,
    ) -> StreamResult<(String, Vec<RawEntry>, Vec<String>)>;

    /// Close the underlying connection, if any. A no-op for
    /// connectionless fakes; `RedisStreamLog` drops its
    /// `ConnectionManager` so a later call legally reopens it.
    async fn close(&mut self) {}
}

impl From<StreamLogError> for MailboxError {
    fn from(err: StreamLogError) -> Self {
        match err {
            StreamLogError::Other(inner) => inner,
            StreamLogError::BusyGroup => MailboxError::Config("consumer group already exists".into()),
            StreamLogError::NoGroup => MailboxError::Config("consumer group does not exist".into()),
        }
    }
}

/// `StreamLog` backed by a real Redis-streams-compatible server.
pub struct RedisStreamLog {
    conn: Option<ConnectionManager>,
    redis_url: String,
}

impl RedisStreamLog {
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            conn: None,
            redis_url: redis_url.into(),
        }
    }

    /// Lazily open a connection, ping it, and cache the handle.
    /// Subsequent calls are no-ops (component C1, spec.md §4.1).
    async fn ensure(&mut self) -> StreamResult<&mut ConnectionManager> {
        if self.conn.is_none() {
            let client = Client::open(self.redis_url.as_str())
                .map_err(|e| StreamLogError::Other(mailbox_common::classify_connect_error(e)))?;
            let mut manager = ConnectionManager::new(client)
                .await
                .map_err(|e| StreamLogError::Other(mailbox_common::classify_connect_error(e)))?;
            redis::cmd("PING")
                .query_async::<_, String>(&mut manager)
                .await
                .map_err(|e| StreamLogError::Other(mailbox_common::classify_connect_error(e)))?;
            info!("connected to log server at {}", self.redis_url);
            self.conn = Some(manager);
        }
        Ok(self.conn.as_mut().expect("connection just established"))
    }

    fn classify_io(err: RedisError) -> StreamLogError {
        if mailbox_common::is_busygroup(&err) {
            StreamLogError::BusyGroup
        } else if mailbox_common::is_nogroup(&err) {
            StreamLogError::NoGroup
        } else {
            StreamLogError::Other(MailboxError::Io(err))
        }
    }
}

#[async_trait]
impl StreamLog for RedisStreamLog {
    async fn ping(&mut self) -> StreamResult<()> {
        let conn = self.ensure().await?;
        redis::cmd("PING")
            .query_async::<_, String>(conn)
            .await
            .map_err(Self::classify_io)?;
        Ok(())
    }

    async fn xadd(
        &mut self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: usize,
    ) -> StreamResult<String> {
        let conn = self.ensure().await?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(maxlen)
            .arg("*");
        for (key, value) in fields {
            cmd.arg(key).arg(value);
        }
        let id: String = cmd.query_async(conn).await.map_err(Self::classify_io)?;
        Ok(id)
    }

    async fn xgroup_create(&mut self, stream: &str, group: &str) -> StreamResult<()> {
        let conn = self.ensure().await?;
        let result: Result<String, RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(Self::classify_io(e)),
        }
    }

    async fn xreadgroup(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> StreamResult<Vec<RawEntry>> {
        let conn = self.ensure().await?;
        let response: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(conn)
            .await
            .map_err(Self::classify_io)?;

        Ok(parse_xreadgroup(response))
    }

    async fn xack(&mut self, stream: &str, group: &str, id: &str) -> StreamResult<()> {
        let conn = self.ensure().await?;
        let _: usize = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .query_async(conn)
            .await
            .map_err(Self::classify_io)?;
        Ok(())
    }

    async fn xpending_probe(&mut self, stream: &str, group: &str) -> StreamResult<Vec<String>> {
        let conn = self.ensure().await?;
        let response: Value = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(Self::classify_io)?;

        Ok(parse_xpending_probe(response))
    }

    async fn xautoclaim(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        start: &str,
        count: usize,
    ) -> StreamResult<(String, Vec<RawEntry>, Vec<String>)> {
        let conn = self.ensure().await?;
        let response: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(start)
            .arg("COUNT")
            .arg(count)
            .query_async(conn)
            .await
            .map_err(Self::classify_io)?;

        parse_xautoclaim(response)
            .ok_or_else(|| StreamLogError::Other(MailboxError::Config("malformed XAUTOCLAIM reply".into())))
    }

    /// Drop the connection. Mirrors spec.md §4.1's `stop` side effect;
    /// a subsequent call through `ensure` legally reopens it.
    async fn close(&mut self) {
        self.conn = None;
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

fn value_to_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Data(bytes) => Some(bytes.clone()),
        Value::Status(s) => Some(s.clone().into_bytes()),
        _ => None,
    }
}

/// Parse one entry's field list (`[key1, val1, key2, val2, ...]`).
fn parse_fields(value: &Value) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    if let Value::Bulk(items) = value {
        for chunk in items.chunks(2) {
            if let [k, v] = chunk {
                if let Some(key) = value_to_string(k) {
                    out.push((key, value_to_bytes(v).unwrap_or_default()));
                }
            }
        }
    }
    out
}

/// Parse one `[id, fields]` message pair.
fn parse_entry(value: &Value) -> Option<RawEntry> {
    if let Value::Bulk(parts) = value {
        if parts.len() < 2 {
            return None;
        }
        let id = value_to_string(&parts[0])?;
        let fields = parse_fields(&parts[1]);
        return Some((id, fields));
    }
    None
}

/// `XREADGROUP` replies as `[[stream_name, [entry, entry, ...]]]`.
fn parse_xreadgroup(value: Value) -> Vec<RawEntry> {
    let mut out = Vec::new();
    if let Value::Bulk(streams) = value {
        for stream_entry in streams {
            if let Value::Bulk(parts) = stream_entry {
                if parts.len() < 2 {
                    continue;
                }
                if let Value::Bulk(messages) = &parts[1] {
                    for message in messages {
                        if let Some(entry) = parse_entry(message) {
                            out.push(entry);
                        }
                    }
                }
            }
        }
    }
    out
}

/// `XPENDING key group - + 1` replies as a list of
/// `[id, consumer, idle_ms, delivery_count]` summaries (or empty).
fn parse_xpending_probe(value: Value) -> Vec<String> {
    let mut out = Vec::new();
    if let Value::Bulk(entries) = value {
        for entry in entries {
            if let Value::Bulk(parts) = entry {
                if let Some(first) = parts.first().and_then(value_to_string) {
                    out.push(first);
                }
            }
        }
    }
    out
}

/// `XAUTOCLAIM` replies as `[next_cursor, [entry, ...], [deleted_id, ...]]`
/// (the third element was added in Redis 7; older servers omit it).
fn parse_xautoclaim(value: Value) -> Option<(String, Vec<RawEntry>, Vec<String>)> {
    if let Value::Bulk(parts) = value {
        if parts.len() < 2 {
            return None;
        }
        let cursor = value_to_string(&parts[0])?;
        let entries = match &parts[1] {
            Value::Bulk(messages) => messages.iter().filter_map(parse_entry).collect(),
            _ => Vec::new(),
        };
        let deleted = match parts.get(2) {
            Some(Value::Bulk(ids)) => ids.iter().filter_map(value_to_string).collect(),
            _ => Vec::new(),
        };
        return Some((cursor, entries, deleted));
    }
    None
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    //! An in-memory `StreamLog` used to test the recovery engine and
    //! consumer loop without a live Redis server.

    use super::*;
    use std::collections::HashMap;

    #[derive(Clone)]
    struct StoredEntry {
        id: String,
        fields: Vec<(String, Vec<u8>)>,
        delivered_to: Option<String>,
    }

    #[derive(Default)]
    struct Stream {
        entries: Vec<StoredEntry>,
        groups: HashMap<String, Group>,
        next_seq: u64,
    }

    #[derive(Default)]
    struct Group {
        /// ids delivered but not yet acked, per consumer.
        pending: Vec<String>,
        /// cursor into `entries` for "never yet delivered to anyone".
        next_new_index: usize,
    }

    /// In-memory fake log. Good enough to exercise consumer-group
    /// semantics (BUSYGROUP, NOGROUP, pending tracking, XAUTOCLAIM
    /// forward progress) without a real server.
    #[derive(Default)]
    pub struct FakeStreamLog {
        streams: HashMap<String, Stream>,
        pub xautoclaim_calls: usize,
    }

    impl FakeStreamLog {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a stream with a raw entry, as if a peer had called `XADD`.
        pub fn seed(&mut self, stream: &str, fields: Vec<(String, String)>) -> String {
            let s = self.streams.entry(stream.to_string()).or_default();
            s.next_seq += 1;
            let id = format!("{}-0", s.next_seq);
            s.entries.push(StoredEntry {
                id: id.clone(),
                fields: fields.into_iter().map(|(k, v)| (k, v.into_bytes())).collect(),
                delivered_to: None,
            });
            id
        }

        /// Deliver the next undelivered entry to `consumer` without
        /// acking it, simulating a prior incarnation that crashed
        /// mid-processing (used to set up recovery tests).
        pub fn force_deliver_one(&mut self, stream: &str, group: &str, consumer: &str) -> Option<String> {
            let s = self.streams.get_mut(stream)?;
            let g = s.groups.entry(group.to_string()).or_default();
            if g.next_new_index >= s.entries.len() {
                return None;
            }
            let entry = &mut s.entries[g.next_new_index];
            entry.delivered_to = Some(consumer.to_string());
            g.pending.push(entry.id.clone());
            g.next_new_index += 1;
            Some(entry.id.clone())
        }

        pub fn pending_count(&self, stream: &str, group: &str) -> usize {
            self.streams
                .get(stream)
                .and_then(|s| s.groups.get(group))
                .map(|g| g.pending.len())
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl StreamLog for FakeStreamLog {
        async fn ping(&mut self) -> StreamResult<()> {
            Ok(())
        }

        async fn xadd(
            &mut self,
            stream: &str,
            fields: &[(String, String)],
            _maxlen: usize,
        ) -> StreamResult<String> {
            Ok(self.seed(stream, fields.to_vec()))
        }

        async fn xgroup_create(&mut self, stream: &str, group: &str) -> StreamResult<()> {
            let s = self.streams.entry(stream.to_string()).or_default();
            if s.groups.contains_key(group) {
                return Err(StreamLogError::BusyGroup);
            }
            s.groups.insert(group.to_string(), Group::default());
            Ok(())
        }

        async fn xreadgroup(
            &mut self,
            stream: &str,
            group: &str,
            consumer: &str,
            count: usize,
            _block_ms: usize,
        ) -> StreamResult<Vec<RawEntry>> {
            let s = match self.streams.get_mut(stream) {
                Some(s) => s,
                None => return Err(StreamLogError::NoGroup),
            };
            let g = match s.groups.get_mut(group) {
                Some(g) => g,
                None => return Err(StreamLogError::NoGroup),
            };

            let mut out = Vec::new();
            while out.len() < count && g.next_new_index < s.entries.len() {
                let entry = &mut s.entries[g.next_new_index];
                entry.delivered_to = Some(consumer.to_string());
                g.pending.push(entry.id.clone());
                out.push((entry.id.clone(), entry.fields.clone()));
                g.next_new_index += 1;
            }
            Ok(out)
        }

        async fn xack(&mut self, stream: &str, group: &str, id: &str) -> StreamResult<()> {
            if let Some(s) = self.streams.get_mut(stream) {
                if let Some(g) = s.groups.get_mut(group) {
                    g.pending.retain(|pending_id| pending_id != id);
                }
            }
            Ok(())
        }

        async fn xpending_probe(&mut self, stream: &str, group: &str) -> StreamResult<Vec<String>> {
            let s = match self.streams.get(stream) {
                Some(s) => s,
                None => return Err(StreamLogError::NoGroup),
            };
            let g = match s.groups.get(group) {
                Some(g) => g,
                None => return Err(StreamLogError::NoGroup),
            };
            Ok(g.pending.first().cloned().into_iter().collect())
        }

        async fn xautoclaim(
            &mut self,
            stream: &str,
            group: &str,
            consumer: &str,
            _min_idle_ms: u64,
            start: &str,
            count: usize,
        ) -> StreamResult<(String, Vec<RawEntry>, Vec<String>)> {
            self.xautoclaim_calls += 1;
            let s = match self.streams.get_mut(stream) {
                Some(s) => s,
                None => return Err(StreamLogError::NoGroup),
            };
            let g = match s.groups.get_mut(group) {
                Some(g) => g,
                None => return Err(StreamLogError::NoGroup),
            };

            // Deterministic claim order: entries currently pending,
            // sorted by id, starting strictly after `start`.
            let mut candidates: Vec<String> = g.pending.clone();
            candidates.sort();
            candidates.retain(|id| id.as_str() > start || start == "0-0");

            let batch: Vec<String> = candidates.into_iter().take(count).collect();
            let mut claimed = Vec::new();
            for id in &batch {
                if let Some(entry) = s.entries.iter_mut().find(|e| &e.id == id) {
                    entry.delivered_to = Some(consumer.to_string());
                    claimed.push((entry.id.clone(), entry.fields.clone()));
                }
            }

            let next_cursor = match claimed.last() {
                Some((id, _)) => id.clone(),
                None => "0-0".to_string(),
            };

            Ok((next_cursor, claimed, Vec::new()))
        }
    }
}
