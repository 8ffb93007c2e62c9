//! Docker host addresses and SSH forwarding of the remote daemon socket
//!
//! `ssh://` hosts are reached by running the system `ssh` client with a
//! stream-local forward (`-L local.sock:/var/run/docker.sock`). The local
//! socket lives in a private temporary directory and the `ssh` process is
//! killed when the tunnel is dropped.

use crate::error::HostError;
use anyhow::Context;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Daemon socket path on the remote host
pub const DEFAULT_REMOTE_SOCKET: &str = "/var/run/docker.sock";

/// How long to wait for `ssh` to expose the forwarded socket
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Where the Docker daemon lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerHost {
    Ssh(SshTarget),
    Unix(PathBuf),
    Tcp(String),
}

impl DockerHost {
    pub fn parse(host: &str) -> Result<Self, HostError> {
        if let Some(rest) = host.strip_prefix("ssh://") {
            return SshTarget::parse(host, rest).map(DockerHost::Ssh);
        }
        if let Some(path) = host.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(HostError::MissingHostname(host.to_string()));
            }
            return Ok(DockerHost::Unix(PathBuf::from(path)));
        }
        if host.starts_with("tcp://") || host.starts_with("http://") {
            return Ok(DockerHost::Tcp(host.to_string()));
        }
        Err(HostError::UnsupportedScheme(host.to_string()))
    }
}

impl fmt::Display for DockerHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DockerHost::Ssh(target) => write!(f, "ssh://{}", target),
            DockerHost::Unix(path) => write!(f, "unix://{}", path.display()),
            DockerHost::Tcp(url) => f.write_str(url),
        }
    }
}

/// `user@host[:port]` destination of an SSH connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SshTarget {
    fn parse(original: &str, rest: &str) -> Result<Self, HostError> {
        let rest = rest.trim_end_matches('/');
        let (user, host_port) = match rest.rsplit_once('@') {
            Some((user, host_port)) if !user.is_empty() => (Some(user.to_string()), host_port),
            Some((_, host_port)) => (None, host_port),
            None => (None, rest),
        };

        let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| HostError::MissingHostname(original.to_string()))?;
            let port = match after {
                "" => None,
                after => match after.strip_prefix(':') {
                    Some(port) => Some(parse_port(original, port)?),
                    None => return Err(invalid_port(original, after)),
                },
            };
            (host, port)
        } else {
            match host_port.split_once(':') {
                // an unbracketed IPv6 address carries no port
                Some((_, port)) if port.contains(':') => (host_port, None),
                Some((host, port)) => (host, Some(parse_port(original, port)?)),
                None => (host_port, None),
            }
        };

        if host.is_empty() {
            return Err(HostError::MissingHostname(original.to_string()));
        }

        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }

    /// `user@host` as passed to `ssh`, with IPv6 addresses unbracketed
    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Arguments for an `ssh` process forwarding `remote_socket` to `local_socket`
    pub fn ssh_args(&self, local_socket: &Path, remote_socket: &str) -> Vec<String> {
        let mut args = vec![
            "-nNT".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            "StreamLocalBindUnlink=yes".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-L".to_string(),
            format!("{}:{}", local_socket.display(), remote_socket),
        ];
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(self.destination());
        args
    }
}

fn parse_port(original: &str, port: &str) -> Result<u16, HostError> {
    port.parse::<u16>()
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| invalid_port(original, port))
}

fn invalid_port(original: &str, port: &str) -> HostError {
    HostError::InvalidPort {
        host: original.to_string(),
        port: port.to_string(),
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// A running `ssh` socket forward
pub struct SshTunnel {
    child: Child,
    socket_path: PathBuf,
    _dir: TempDir,
}

impl SshTunnel {
    /// Start forwarding and wait until the local socket exists
    pub async fn open(
        target: &SshTarget,
        remote_socket: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Self::open_with("ssh", target, remote_socket, timeout).await
    }

    /// Like [`SshTunnel::open`], running `program` in place of `ssh`
    pub async fn open_with(
        program: impl AsRef<OsStr>,
        target: &SshTarget,
        remote_socket: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let program = program.as_ref();
        let dir = tempfile::Builder::new()
            .prefix("homelab-ssh-")
            .tempdir()
            .context("Failed to create a directory for the forwarded Docker socket")?;
        let socket_path = dir.path().join("docker.sock");

        info!(target = %target, remote_socket, "Opening SSH tunnel to Docker host");

        let mut cmd = Command::new(program);
        cmd.args(target.ssh_args(&socket_path, remote_socket));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to run '{}'. Ensure the OpenSSH client is installed and on PATH",
                program.to_string_lossy()
            )
        })?;

        let started = tokio::time::Instant::now();
        loop {
            if socket_path.exists() {
                break;
            }

            if let Some(status) = child.try_wait()? {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                anyhow::bail!(
                    "ssh to '{}' exited ({}) before forwarding the Docker socket: {}. \
                     Check that key-based login works and that the user can access {}.",
                    target,
                    status,
                    stderr.trim(),
                    remote_socket
                );
            }

            if started.elapsed() >= timeout {
                let _ = child.kill().await;
                anyhow::bail!(
                    "Timed out after {:.1}s waiting for the SSH tunnel to '{}'",
                    timeout.as_secs_f64(),
                    target
                );
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if let Some(stderr) = child.stderr.take() {
            let host = target.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim_end();
                    if !line.is_empty() {
                        warn!(target: "ssh", host, "{}", line);
                    }
                }
            });
        }

        debug!(socket = %socket_path.display(), "SSH tunnel ready");

        Ok(Self {
            child,
            socket_path,
            _dir: dir,
        })
    }

    /// Local end of the forwarded socket
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// OS process ID of `ssh`, while it runs
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Stop the `ssh` process and remove the local socket
    pub async fn close(mut self) {
        match self.child.kill().await {
            Ok(()) => debug!("SSH tunnel closed"),
            Err(e) => warn!(error = %e, "Failed to stop ssh process"),
        }
    }
}
