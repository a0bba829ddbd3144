use std::path::PathBuf;
use std::str::FromStr;

/// File name of the write-ahead log inside the data directory.
pub const WAL_FILE_NAME: &str = "courtbook.wal";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    /// Prometheus exporter port; disabled when unset.
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7878,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default   |
    /// |-------------------------------|-----------|
    /// | `COURTBOOK_BIND`              | `0.0.0.0` |
    /// | `COURTBOOK_PORT`              | `7878`    |
    /// | `COURTBOOK_DATA_DIR`          | `./data`  |
    /// | `COURTBOOK_MAX_CONNECTIONS`   | `256`     |
    /// | `COURTBOOK_COMPACT_THRESHOLD` | `1000`    |
    /// | `COURTBOOK_METRICS_PORT`      | disabled  |
    ///
    /// Numeric values that fail to parse fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind: lookup("COURTBOOK_BIND").unwrap_or(defaults.bind),
            port: parse(lookup("COURTBOOK_PORT")).unwrap_or(defaults.port),
            data_dir: lookup("COURTBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: parse(lookup("COURTBOOK_MAX_CONNECTIONS"))
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: parse(lookup("COURTBOOK_COMPACT_THRESHOLD"))
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parse(lookup("COURTBOOK_METRICS_PORT")),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE_NAME)
    }
}

fn parse<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}
