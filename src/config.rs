//! Environment configuration for a provisioning run
//!
//! Every variable is required. Loading collects all missing variables into a
//! single [`ConfigError`] so a run never reaches the Docker host with a
//! partial configuration.

use crate::error::ConfigError;
use std::fmt;

pub const DOCKER_USERNAME: &str = "DOCKER_USERNAME";
pub const DOCKER_HOSTNAME: &str = "DOCKER_HOSTNAME";
pub const DOMAIN_NAME: &str = "DOMAIN_NAME";
pub const DOCKER_SSD_ROOT_PATH: &str = "DOCKER_SSD_ROOT_PATH";
pub const DOCKER_HDD_ROOT_PATH: &str = "DOCKER_HDD_ROOT_PATH";
pub const DOCKER_EXTERNAL_ROOT_PATH: &str = "DOCKER_EXTERNAL_ROOT_PATH";
pub const BESZEL_KEY: &str = "BESZEL_KEY";
pub const LINKWARDEN_DBHOST: &str = "LINKWARDEN_DBHOST";
pub const LINKWARDEN_DBPASSWORD: &str = "LINKWARDEN_DBPASSWORD";
pub const LINKWARDEN_NEXTAUTH_URL: &str = "LINKWARDEN_NEXTAUTH_URL";
pub const LINKWARDEN_NEXTAUTH_SECRET: &str = "LINKWARDEN_NEXTAUTH_SECRET";
pub const MINIFLUX_DBNAME: &str = "MINIFLUX_DBNAME";
pub const MINIFLUX_DBUSERNAME: &str = "MINIFLUX_DBUSERNAME";
pub const MINIFLUX_ADMIN_USERNAME: &str = "MINIFLUX_ADMIN_USERNAME";
pub const MINIFLUX_ADMIN_PASSWORD: &str = "MINIFLUX_ADMIN_PASSWORD";
pub const MINIFLUX_RUN_MIGRATIONS: &str = "MINIFLUX_RUN_MIGRATIONS";
pub const MINIFLUX_CREATE_ADMIN: &str = "MINIFLUX_CREATE_ADMIN";
pub const MINIFLUX_DEBUG: &str = "MINIFLUX_DEBUG";

/// Connection credentials, storage roots and per-service settings
#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    /// SSH user on the Docker host
    pub docker_username: String,
    /// Hostname of the Docker host
    pub docker_hostname: String,
    /// Base domain for routed services (`{service}.{domain}`)
    pub domain_name: String,
    /// Root for fast application data
    pub ssd_path: String,
    /// Root for bulk application data
    pub hdd_path: String,
    /// Root of the external drive
    pub external_path: String,
    /// Public key the Beszel agent accepts from the hub
    pub beszel_key: String,
    /// Shared Postgres host
    pub postgres_db_host: String,
    /// Shared Postgres password
    pub postgres_db_password: String,
    pub linkwarden_nextauth_url: String,
    pub linkwarden_nextauth_secret: String,
    pub miniflux_db_name: String,
    pub miniflux_db_username: String,
    pub miniflux_admin_username: String,
    pub miniflux_admin_password: String,
    pub miniflux_run_migrations: String,
    pub miniflux_create_admin: String,
    pub miniflux_debug: bool,
}

/// Miniflux settings taken from [`Config`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinifluxSettings {
    pub db_name: String,
    pub db_username: String,
    pub admin_username: String,
    pub admin_password: String,
    pub run_migrations: String,
    pub create_admin: String,
    pub debug: bool,
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source
    ///
    /// A variable that is unset or set to the empty string counts as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let mut require = |name: &'static str| -> String {
            match lookup(name).filter(|value| !value.is_empty()) {
                Some(value) => value,
                None => {
                    missing.push(name);
                    String::new()
                }
            }
        };

        let config = Config {
            docker_username: require(DOCKER_USERNAME),
            docker_hostname: require(DOCKER_HOSTNAME),
            domain_name: require(DOMAIN_NAME),
            ssd_path: require(DOCKER_SSD_ROOT_PATH),
            hdd_path: require(DOCKER_HDD_ROOT_PATH),
            external_path: require(DOCKER_EXTERNAL_ROOT_PATH),
            beszel_key: require(BESZEL_KEY),
            postgres_db_host: require(LINKWARDEN_DBHOST),
            postgres_db_password: require(LINKWARDEN_DBPASSWORD),
            linkwarden_nextauth_url: require(LINKWARDEN_NEXTAUTH_URL),
            linkwarden_nextauth_secret: require(LINKWARDEN_NEXTAUTH_SECRET),
            miniflux_db_name: require(MINIFLUX_DBNAME),
            miniflux_db_username: require(MINIFLUX_DBUSERNAME),
            miniflux_admin_username: require(MINIFLUX_ADMIN_USERNAME),
            miniflux_admin_password: require(MINIFLUX_ADMIN_PASSWORD),
            miniflux_run_migrations: require(MINIFLUX_RUN_MIGRATIONS),
            miniflux_create_admin: require(MINIFLUX_CREATE_ADMIN),
            miniflux_debug: require(MINIFLUX_DEBUG) == "1",
        };

        if !missing.is_empty() {
            return Err(ConfigError::Missing { vars: missing });
        }

        Ok(config)
    }

    /// SSH address of the Docker daemon
    pub fn ssh_connection_string(&self) -> String {
        format!("ssh://{}@{}", self.docker_username, self.docker_hostname)
    }

    pub fn miniflux(&self) -> MinifluxSettings {
        MinifluxSettings {
            db_name: self.miniflux_db_name.clone(),
            db_username: self.miniflux_db_username.clone(),
            admin_username: self.miniflux_admin_username.clone(),
            admin_password: self.miniflux_admin_password.clone(),
            run_migrations: self.miniflux_run_migrations.clone(),
            create_admin: self.miniflux_create_admin.clone(),
            debug: self.miniflux_debug,
        }
    }
}

const REDACTED: &str = "<redacted>";

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("docker_username", &self.docker_username)
            .field("docker_hostname", &self.docker_hostname)
            .field("domain_name", &self.domain_name)
            .field("ssd_path", &self.ssd_path)
            .field("hdd_path", &self.hdd_path)
            .field("external_path", &self.external_path)
            .field("beszel_key", &REDACTED)
            .field("postgres_db_host", &self.postgres_db_host)
            .field("postgres_db_password", &REDACTED)
            .field("linkwarden_nextauth_url", &self.linkwarden_nextauth_url)
            .field("linkwarden_nextauth_secret", &REDACTED)
            .field("miniflux_db_name", &self.miniflux_db_name)
            .field("miniflux_db_username", &self.miniflux_db_username)
            .field("miniflux_admin_username", &self.miniflux_admin_username)
            .field("miniflux_admin_password", &REDACTED)
            .field("miniflux_run_migrations", &self.miniflux_run_migrations)
            .field("miniflux_create_admin", &self.miniflux_create_admin)
            .field("miniflux_debug", &self.miniflux_debug)
            .finish()
    }
}
