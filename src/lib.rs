//! Homelab - declarative container provisioning for a remote Docker host
//!
//! This library:
//! - Loads connection details, storage roots and service secrets from the environment
//! - Loads pinned image versions from `image-versions.yaml`
//! - Builds a container spec per service (whoami, Linkwarden, Miniflux, Beszel hub and agent)
//! - Connects to the Docker daemon over an SSH socket forward
//! - Creates, replaces or starts containers so the host matches the specs

pub mod config;
pub mod docker;
pub mod error;
pub mod images;
pub mod provision;
pub mod services;
pub mod spec;
pub mod tunnel;
