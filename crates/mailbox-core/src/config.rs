//! Mailbox configuration and environment resolution.

use tracing::warn;

/// Immutable configuration for a `MailboxService`.
#[derive(Debug, Clone, PartialEq)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    pub stream_prefix: String,
    pub max_stream_length: usize,
    pub poll_interval_secs: f64,
    pub enable_recovery: bool,
    pub recovery_min_idle_time_secs: u64,
    pub recovery_batch_size: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            password: None,
            stream_prefix: "beast:mailbox".to_string(),
            max_stream_length: 1000,
            poll_interval_secs: 2.0,
            enable_recovery: true,
            recovery_min_idle_time_secs: 0,
            recovery_batch_size: 50,
        }
    }
}

impl MailboxConfig {
    /// Build a Redis connection URL from this config's coordinates.
    pub fn redis_url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Resolve configuration from the environment, following the order:
    ///
    /// 1. `REDIS_HOST` (+ `REDIS_PORT`, `REDIS_PASSWORD`, `REDIS_DB`) if
    ///    `REDIS_HOST` is set.
    /// 2. `REDIS_URL` (`redis://` or `rediss://`) if host is unset.
    /// 3. Defaults (`localhost:6379`, db 0, no password).
    ///
    /// An invalid `REDIS_URL` scheme or parse failure logs a warning and
    /// falls back to defaults rather than erroring.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        if let Ok(host) = std::env::var("REDIS_HOST") {
            let port = std::env::var("REDIS_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(6379);
            let db = std::env::var("REDIS_DB")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let password = std::env::var("REDIS_PASSWORD").ok();

            return Self {
                host,
                port,
                db,
                password,
                ..Self::default()
            };
        }

        if let Ok(url) = std::env::var("REDIS_URL") {
            match parse_redis_url(&url) {
                Some((host, port, password, db)) => {
                    return Self {
                        host,
                        port,
                        db,
                        password,
                        ..Self::default()
                    };
                }
                None => {
                    warn!("invalid REDIS_URL '{}', falling back to defaults", url);
                    return Self::default();
                }
            }
        }

        Self::default()
    }
}

/// Parse a `redis://`/`rediss://` URL into `(host, port, password, db)`.
///
/// Returns `None` for any scheme other than `redis`/`rediss`, or for a
/// URL that fails to parse at all.
fn parse_redis_url(raw: &str) -> Option<(String, u16, Option<String>, i64)> {
    let scheme_split = raw.split_once("://")?;
    let (scheme, rest) = scheme_split;
    if scheme != "redis" && scheme != "rediss" {
        return None;
    }

    let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));

    let (userinfo, host_port) = match authority.rsplit_once('@') {
        Some((userinfo, host_port)) => (Some(userinfo), host_port),
        None => (None, authority),
    };

    let password = userinfo.and_then(|ui| {
        let pass = ui.split_once(':').map(|(_, p)| p).unwrap_or(ui);
        if pass.is_empty() {
            None
        } else {
            Some(pass.to_string())
        }
    });

    if host_port.is_empty() {
        return None;
    }

    let (host, port) = match host_port.split_once(':') {
        Some((h, p)) => {
            let port: u16 = p.parse().ok()?;
            (h.to_string(), port)
        }
        None => (host_port.to_string(), 6379),
    };

    let db = if path.is_empty() {
        0
    } else {
        path.parse::<i64>().unwrap_or(0)
    };

    Some((host, port, password, db))
}
