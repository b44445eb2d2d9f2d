use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginsConfig {
    /// Discovery directory
    #[serde(default = "default_plugins_dir")]
    pub dir: PathBuf,

    /// Quarantine folder name, relative to `dir`
    #[serde(default = "default_failed_dir")]
    pub failed_dir: String,

    /// File extension → interpreter running out-of-process plugins
    #[serde(default = "default_interpreters")]
    pub interpreters: BTreeMap<String, PathBuf>,

    /// Command receiving a plugin's declared requirements as extra arguments,
    /// e.g. `["pip", "install"]`
    #[serde(default)]
    pub requirements_command: Option<Vec<String>>,

    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    #[serde(default = "default_pool_size_per_plugin")]
    pub pool_size_per_plugin: usize,

    /// Deadline for a plugin outcome and between stream fragments; 0 disables
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Frames buffered between the worker pool and the HTTP body
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Bearer key required on mutating routes; open when unset
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
    /// Daily-rolling log files are written here when set
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9099
}

fn default_plugins_dir() -> PathBuf {
    PathBuf::from("./pipelines")
}

fn default_failed_dir() -> String {
    "failed".to_string()
}

fn default_interpreters() -> BTreeMap<String, PathBuf> {
    [("py", "python3"), ("js", "node"), ("sh", "sh")]
        .into_iter()
        .map(|(ext, interpreter)| (ext.to_string(), PathBuf::from(interpreter)))
        .collect()
}

fn default_worker_pool_size() -> usize {
    num_cpus::get() * 4
}

fn default_pool_size_per_plugin() -> usize {
    2
}

fn default_call_timeout_ms() -> u64 {
    300_000
}

fn default_stream_buffer() -> usize {
    32
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: default_plugins_dir(),
            failed_dir: default_failed_dir(),
            interpreters: default_interpreters(),
            requirements_command: None,
            worker_pool_size: default_worker_pool_size(),
            pool_size_per_plugin: default_pool_size_per_plugin(),
            call_timeout_ms: default_call_timeout_ms(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

impl PluginsConfig {
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn failed_path(&self) -> PathBuf {
        self.dir.join(&self.failed_dir)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms))
    }
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
