// SSH tunnel — local port forward to a database only reachable on its host.
//
// Spawns the system `ssh` client (`ssh -N -L <local>:127.0.0.1:<db port>
// user@host`) and waits until the forwarded port accepts connections. Only
// key-based authentication is supported: ssh runs in batch mode and never
// prompts. The child process is killed when the tunnel is dropped.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tracing::{debug, info};

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_RETRY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub ssh_user: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    /// Private key; ssh's defaults (agent, ~/.ssh) are used when unset.
    pub identity: Option<PathBuf>,
    /// Port the database listens on, on the remote host's loopback.
    pub remote_port: u16,
}

impl TunnelConfig {
    /// Arguments for the ssh client forwarding `local_port`.
    pub fn ssh_args(&self, local_port: u16) -> Vec<String> {
        let mut args = vec![
            "-N".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-p".to_string(),
            self.ssh_port.to_string(),
            "-L".to_string(),
            format!("{local_port}:127.0.0.1:{}", self.remote_port),
        ];
        if let Some(identity) = &self.identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{}", self.ssh_user, self.ssh_host));
        args
    }
}

pub struct SshTunnel {
    child: Child,
    local_port: u16,
}

impl SshTunnel {
    /// Start the tunnel and wait until the local end is usable.
    pub async fn open(config: &TunnelConfig) -> Result<Self> {
        let local_port = free_local_port().await?;
        let args = config.ssh_args(local_port);
        debug!(?args, "Starting ssh");

        let child = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to start ssh. Is the OpenSSH client installed?")?;

        let mut tunnel = Self { child, local_port };
        tunnel.wait_until_ready().await?;

        info!(
            host = %config.ssh_host,
            local_port,
            remote_port = config.remote_port,
            "SSH tunnel established"
        );
        Ok(tunnel)
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// False once the ssh process has exited.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn wait_until_ready(&mut self) -> Result<()> {
        for _ in 0..CONNECT_ATTEMPTS {
            if let Some(status) = self.child.try_wait()? {
                anyhow::bail!("ssh exited before the tunnel came up ({status})");
            }
            if TcpStream::connect(("127.0.0.1", self.local_port)).await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(CONNECT_RETRY).await;
        }
        anyhow::bail!(
            "SSH tunnel did not accept connections on port {} in time",
            self.local_port
        )
    }

    /// Tear the tunnel down.
    pub async fn close(mut self) -> Result<()> {
        self.child.kill().await.context("Failed to stop ssh")?;
        info!("SSH tunnel closed");
        Ok(())
    }
}

/// Ask the OS for a port nobody is listening on.
async fn free_local_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("Failed to reserve a local port for the tunnel")?;
    Ok(listener.local_addr()?.port())
}
