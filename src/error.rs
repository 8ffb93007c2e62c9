//! Error types for configuration, image versions, specs and daemon addresses

use thiserror::Error;

/// Environment configuration is incomplete
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// One or more required variables are unset or empty
    #[error("required environment variables are not set: {}", vars.join(", "))]
    Missing { vars: Vec<&'static str> },
}

/// Image version file errors
#[derive(Debug, Error)]
pub enum ImageError {
    /// The image version file could not be read
    #[error("failed to read image versions from '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// The image version file is not valid YAML
    #[error("failed to parse image versions: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// No image is pinned for the requested key
    #[error("no image version pinned for '{0}' in the images map")]
    Unknown(String),
}

/// A container specification that cannot be submitted
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("container name must not be empty")]
    EmptyName,
    #[error("container '{0}': image reference must not be empty")]
    EmptyImage(String),
    #[error("container '{name}': volume has an empty {field}")]
    EmptyVolumePath { name: String, field: &'static str },
    #[error("container '{0}': routing labels require an internal port")]
    MissingRoutePort(String),
    #[error("container name '{0}' is declared more than once")]
    DuplicateName(String),
}

/// A Docker host address that cannot be used
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostError {
    #[error(
        "invalid docker host '{0}': expected 'ssh://user@host[:port]', \
         'unix:///path/to/socket' or 'tcp://host:port'"
    )]
    UnsupportedScheme(String),
    #[error("invalid docker host '{0}': missing hostname")]
    MissingHostname(String),
    #[error("invalid docker host '{host}': bad port '{port}'")]
    InvalidPort { host: String, port: String },
}
