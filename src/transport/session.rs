//! Session with a `cfsync serve` process, local or over SSH.
//!
//! The child's stdin/stdout carry the file stream frames. Encryption and
//! authentication belong to the outer transport (SSH here).

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

/// Where to reach the serving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
}

impl SshTarget {
    /// Parse `[user@]host[:port]`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (user, rest) = match spec.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => anyhow::bail!("Empty user in SSH target '{}'", spec),
            None => (None, spec),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .with_context(|| format!("Invalid port in SSH target '{}'", spec))?;
                (host, Some(port))
            }
            None => (rest, None),
        };
        if host.is_empty() {
            anyhow::bail!("Empty host in SSH target '{}'", spec);
        }
        Ok(Self {
            host: host.to_string(),
            user,
            port,
        })
    }
}

/// A running `cfsync serve` child and its stdio.
pub struct ServeSession {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl ServeSession {
    /// Run `cfsync serve <remote_path>` on `target` through ssh.
    pub async fn connect_ssh(target: &SshTarget, remote_path: &Path) -> Result<Self> {
        let mut cmd = Command::new("ssh");
        cmd.arg(&target.host);
        if let Some(user) = &target.user {
            cmd.arg("-l").arg(user);
        }
        if let Some(port) = target.port {
            cmd.arg("-p").arg(port.to_string());
        }

        cmd.arg("cfsync");
        cmd.arg("serve");
        cmd.arg(remote_path);

        debug!(host = %target.host, path = %remote_path.display(), "spawning remote serve");
        Self::spawn(cmd).context("Failed to spawn SSH process")
    }

    /// Run `cfsync serve <path>` locally with the current executable.
    pub async fn connect_local(path: &Path) -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate cfsync executable")?;
        Self::connect_with(&exe, path).await
    }

    /// Run `<exe> serve <path>`.
    pub async fn connect_with(exe: &Path, path: &Path) -> Result<Self> {
        let mut cmd = Command::new(exe);
        cmd.arg("serve");
        cmd.arg(path);

        debug!(path = %path.display(), "spawning local serve");
        Self::spawn(cmd).context("Failed to spawn cfsync process")
    }

    fn spawn(mut cmd: Command) -> Result<Self> {
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().context("Failed to open stdin")?;
        let stdout = child.stdout.take().context("Failed to open stdout")?;

        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }

    /// Split into the child's (stdout, stdin): what we read, what we write.
    pub fn split(self) -> (ChildStdout, ChildStdin, Child) {
        (self.stdout, self.stdin, self.child)
    }
}
