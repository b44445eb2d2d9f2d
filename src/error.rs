use std::io;
use thiserror::Error;
use warp::http::StatusCode;

use crate::plugin::schema::PluginError;
use crate::plugin::valves::ValvesError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to load plugin: {0}")]
    Load(#[from] LoadError),

    #[error("{0}")]
    Valves(#[from] ValvesError),

    #[error("{0}")]
    Plugin(#[from] PluginError),

    #[error("Pipeline not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Worker pool closed")]
    PoolClosed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Failures while turning a source file into a live plugin module.
///
/// Everything except `Discovery` aborts the load of that single file and
/// sends it to quarantine.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Malformed metadata block: {reason}")]
    Discovery { reason: String },

    #[error("Failed to prepare plugin state folder: {reason}")]
    StateDir { reason: String },

    #[error("Failed to install requirements: {reason}")]
    DependencyInstall { reason: String },

    #[error("Failed to import plugin: {reason}")]
    Import { reason: String },

    #[error("Failed to instantiate plugin: {reason}")]
    Instantiation { reason: String },

    #[error("Plugin exposes no usable entry point: {reason}")]
    CapabilityMissing { reason: String },

    #[error("Module id '{id}' is already registered")]
    DuplicateId { id: String },

    #[error("Module id '{id}' is invalid (must be non-empty and contain no '.')")]
    InvalidId { id: String },

    #[error("Invalid valves: {0}")]
    Valves(#[from] ValvesError),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Valves(ValvesError::Sidecar { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::InvalidRequest(_) | GatewayError::Valves(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Plugin(PluginError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Download(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl warp::reject::Reject for GatewayError {}
