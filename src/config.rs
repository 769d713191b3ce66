use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::aggregate::{Normalization, NormalizationPolicy, Window};
use crate::pipeline::filter::DEFAULT_TOPIC_KEYWORDS;
use crate::tunnel::TunnelConfig;

/// Records per batch unless BULLBEAR_BATCH_SIZE or --batch-size says otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 50;
/// Pause between cycles for the stream-driven roles.
pub const DEFAULT_SLEEP_MS: u64 = 1000;
/// Pause between cycles for the `aggregate` role.
pub const DEFAULT_AGGREGATE_SLEEP_MS: u64 = 60_000;
pub const DEFAULT_CACHE_CAPACITY: usize = 50_000;

const DEFAULT_DB_PORT: u16 = 5432;
const DEFAULT_SSH_PORT: u16 = 22;

/// Central configuration loaded from environment variables.
///
/// The .env file is loaded automatically at startup via dotenvy. CLI flags
/// override the batch size, sleep and database name after loading.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    /// PostgreSQL connection URL (when set and starts with postgres://, uses Postgres backend)
    pub database_url: Option<String>,
    /// PostgreSQL host, used to build a URL when DATABASE_URL is unset.
    /// Also the SSH host when tunnelling.
    pub db_host: Option<String>,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub ssh_user: Option<String>,
    pub ssh_identity: Option<PathBuf>,
    pub ssh_port: u16,
    /// `None` means the role's default.
    pub batch_size: Option<usize>,
    /// `None` means the role's default.
    pub sleep_ms: Option<u64>,
    pub cache_capacity: usize,
    pub windows: Vec<Window>,
    pub normalization: NormalizationPolicy,
    pub topic_keywords: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source. `load()` passes the
    /// process environment; tests pass a map.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let windows = match get("BULLBEAR_WINDOWS") {
            Some(raw) => parse_windows(&raw)?,
            None => vec![Window::default()],
        };

        let base = match get("BULLBEAR_NORMALIZATION") {
            Some(raw) => parse_normalization("BULLBEAR_NORMALIZATION", &raw)?,
            None => Normalization::default(),
        };
        let mut normalization = NormalizationPolicy::uniform(base);
        if let Some(raw) = get("BULLBEAR_NORMALIZATION_STOCKTWITS") {
            normalization.stocktwits = parse_normalization("BULLBEAR_NORMALIZATION_STOCKTWITS", &raw)?;
        }
        if let Some(raw) = get("BULLBEAR_NORMALIZATION_TWITTER") {
            normalization.twitter = parse_normalization("BULLBEAR_NORMALIZATION_TWITTER", &raw)?;
        }

        let topic_keywords = match get("BULLBEAR_TOPIC_KEYWORDS") {
            Some(raw) => raw
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
            None => DEFAULT_TOPIC_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        };

        let config = Self {
            db_path: get("BULLBEAR_DB_PATH").unwrap_or_else(|| "./bullbear.db".to_string()),
            database_url: get("DATABASE_URL"),
            db_host: get("BULLBEAR_DB_HOST"),
            db_port: parse_or("BULLBEAR_DB_PORT", get("BULLBEAR_DB_PORT"), DEFAULT_DB_PORT)?,
            db_user: get("BULLBEAR_DB_USER").unwrap_or_else(|| "postgres".to_string()),
            db_password: lookup("BULLBEAR_DB_PASSWORD").unwrap_or_default(),
            db_name: get("BULLBEAR_DB_NAME").unwrap_or_else(|| "bullbear".to_string()),
            ssh_user: get("BULLBEAR_SSH_USER"),
            ssh_identity: get("BULLBEAR_SSH_IDENTITY").map(PathBuf::from),
            ssh_port: parse_or("BULLBEAR_SSH_PORT", get("BULLBEAR_SSH_PORT"), DEFAULT_SSH_PORT)?,
            batch_size: parse_opt("BULLBEAR_BATCH_SIZE", get("BULLBEAR_BATCH_SIZE"))?,
            sleep_ms: parse_opt("BULLBEAR_SLEEP_MS", get("BULLBEAR_SLEEP_MS"))?,
            cache_capacity: parse_or(
                "BULLBEAR_CACHE_CAPACITY",
                get("BULLBEAR_CACHE_CAPACITY"),
                DEFAULT_CACHE_CAPACITY,
            )?,
            windows,
            normalization,
            topic_keywords,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the engine relies on. Run again after CLI
    /// overrides are applied.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == Some(0) {
            anyhow::bail!("Batch size must be at least 1");
        }
        if self.cache_capacity == 0 {
            anyhow::bail!("BULLBEAR_CACHE_CAPACITY must be at least 1");
        }
        if self.windows.is_empty() {
            anyhow::bail!("BULLBEAR_WINDOWS must name at least one window");
        }
        Ok(())
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    /// Inter-cycle sleep, falling back to the role's default.
    pub fn sleep_ms_or(&self, role_default: u64) -> u64 {
        self.sleep_ms.unwrap_or(role_default)
    }

    /// Whether a PostgreSQL store is configured (by URL or by host).
    pub fn uses_postgres(&self) -> bool {
        self.database_url
            .as_deref()
            .is_some_and(|url| url.starts_with("postgres://") || url.starts_with("postgresql://"))
            || self.db_host.is_some()
    }

    /// The PostgreSQL URL to connect to. When a tunnel is up, pass its local
    /// port: the URL is then built from the parts and points at the tunnel.
    pub fn postgres_url(&self, tunnel_port: Option<u16>) -> Result<String> {
        if let Some(port) = tunnel_port {
            return Ok(self.url_from_parts("127.0.0.1", port));
        }
        if let Some(url) = &self.database_url {
            return Ok(url.clone());
        }
        match &self.db_host {
            Some(host) => Ok(self.url_from_parts(host, self.db_port)),
            None => anyhow::bail!(
                "No PostgreSQL database configured. Set DATABASE_URL or BULLBEAR_DB_HOST."
            ),
        }
    }

    fn url_from_parts(&self, host: &str, port: u16) -> String {
        let credentials = if self.db_password.is_empty() {
            encode_userinfo(&self.db_user)
        } else {
            format!(
                "{}:{}",
                encode_userinfo(&self.db_user),
                encode_userinfo(&self.db_password)
            )
        };
        format!(
            "postgres://{credentials}@{host}:{port}/{}",
            encode_userinfo(&self.db_name)
        )
    }

    /// Check that an SSH tunnel can be opened and describe it.
    /// Call this before connecting with `--ssh`.
    pub fn require_tunnel(&self) -> Result<TunnelConfig> {
        let Some(ssh_host) = self.db_host.clone() else {
            anyhow::bail!(
                "BULLBEAR_DB_HOST not set. --ssh tunnels to the database host.\n\
                 See .env.example for the required variables."
            );
        };
        let Some(ssh_user) = self.ssh_user.clone() else {
            anyhow::bail!(
                "BULLBEAR_SSH_USER not set. Add it to your .env file.\n\
                 See .env.example for the required variables."
            );
        };
        if self.database_url.is_some() {
            anyhow::bail!(
                "--ssh builds the connection from BULLBEAR_DB_* parts. Unset DATABASE_URL."
            );
        }
        Ok(TunnelConfig {
            ssh_user,
            ssh_host,
            ssh_port: self.ssh_port,
            identity: self.ssh_identity.clone(),
            remote_port: self.db_port,
        })
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(parse_opt(key, raw)?.unwrap_or(default))
}

fn parse_opt<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.map(|v| {
        v.trim()
            .parse::<T>()
            .with_context(|| format!("{key} has an invalid value: {v:?}"))
    })
    .transpose()
}

fn parse_normalization(key: &str, raw: &str) -> Result<Normalization> {
    Normalization::from_str(raw).with_context(|| {
        format!("{key} must be `per-row` or `impact-weighted`, got {raw:?}")
    })
}

/// Comma-separated window widths in seconds, e.g. `"3600, 43200"`.
fn parse_windows(raw: &str) -> Result<Vec<Window>> {
    let mut windows = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let seconds: i64 = part
            .parse()
            .with_context(|| format!("BULLBEAR_WINDOWS has an invalid width: {part:?}"))?;
        let window = Window::new(seconds)
            .with_context(|| format!("BULLBEAR_WINDOWS widths must be positive, got {seconds}"))?;
        if !windows.contains(&window) {
            windows.push(window);
        }
    }
    Ok(windows)
}

/// Everything outside the URL unreserved set.
const USERINFO: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn encode_userinfo(raw: &str) -> String {
    utf8_percent_encode(raw, USERINFO).to_string()
}
