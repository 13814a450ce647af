use std::path::PathBuf;

/// Runtime configuration of the proxy. All persisted-state paths are
/// derived from `data_dir`; callers never hardcode them.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory holding the database files and the server log.
    pub data_dir: PathBuf,
    /// Address the supervised server binds.
    pub bind_ip: String,
    /// Port the supervised server listens on.
    pub port: u16,
    /// Logical database used when an operation names none.
    pub default_db: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("mongod-proxy-data"),
            bind_ip: "127.0.0.1".to_string(),
            port: 27017,
            default_db: "main".to_string(),
        }
    }
}

impl Config {
    /// Directory mongod stores its database files under.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    /// File mongod appends its own log to.
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("mongod.log")
    }

    /// Connection string for the supervised server.
    pub fn uri(&self) -> String {
        format!("mongodb://{}:{}", self.bind_ip, self.port)
    }
}
