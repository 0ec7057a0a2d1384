//! Circuit supervision: one anonymizing proxy process per parallel channel.
//!
//! Each circuit is a `tor` child with its own SOCKS listener on a
//! dynamically chosen loopback port and a private data directory. A circuit
//! is ready once its stdout prints `Bootstrapped 100%`; after that its
//! output is drained into debug logs so the child never blocks on a full
//! pipe.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::io;
use std::process::Stdio;
use tempfile::TempDir;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::task::JoinSet;

use crate::client::HttpClient;

/// Proxy executable looked up on PATH.
const PROXY_COMMAND: &str = "tor";

/// Readiness marker on the proxy's stdout.
const BOOTSTRAP_MARKER: &str = "Bootstrapped 100%";

/// Attempts per circuit. The free-port discovery races against other
/// processes between release and the child's bind, so a failed launch is
/// retried on a fresh port instead of aborting the whole download.
const CREATE_ATTEMPTS: u32 = 3;

/// Error raised when the proxy executable is missing; not worth retrying.
#[derive(Debug)]
pub struct ProxyNotFound;

impl fmt::Display for ProxyNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} executable not found in PATH", PROXY_COMMAND)
    }
}

impl std::error::Error for ProxyNotFound {}

/// A supervised proxy process and its SOCKS listener port.
///
/// The temp data directory lives as long as the circuit; the child is
/// killed on drop so no process outlives the download on any exit path.
pub struct Circuit {
    child: Child,
    port: u16,
    _data_dir: TempDir,
}

impl Circuit {
    /// Launch and bootstrap one circuit, retrying on a fresh port when the
    /// child dies before reaching readiness.
    pub async fn create() -> Result<Circuit> {
        let mut attempt = 1u32;
        loop {
            match Self::try_create().await {
                Ok(circuit) => return Ok(circuit),
                Err(e) => {
                    if e.is::<ProxyNotFound>() || attempt >= CREATE_ATTEMPTS {
                        return Err(e);
                    }
                    tracing::warn!(attempt, error = %e, "circuit failed to start, retrying");
                    attempt += 1;
                }
            }
        }
    }

    async fn try_create() -> Result<Circuit> {
        let port = free_socks_port()?;
        let data_dir = tempfile::Builder::new()
            .prefix("ktor-circuit-")
            .tempdir()
            .context("cannot create circuit data directory")?;

        let mut child = Command::new(PROXY_COMMAND)
            .arg("--SOCKSPort")
            .arg(format!("localhost:{}", port))
            .arg("--DataDirectory")
            .arg(data_dir.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    anyhow::Error::new(ProxyNotFound)
                } else {
                    anyhow::Error::new(e).context(format!("cannot start {}", PROXY_COMMAND))
                }
            })?;

        let stdout = child
            .stdout
            .take()
            .context("cannot capture circuit stdout")?;
        let mut lines = BufReader::new(stdout).lines();
        if !wait_for_bootstrap(&mut lines, port).await? {
            let _ = child.start_kill();
            bail!(
                "circuit on port {} exited before reaching '{}'",
                port,
                BOOTSTRAP_MARKER
            );
        }
        tracing::debug!(port, "circuit bootstrapped");

        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(port, "{}", line);
            }
        });

        Ok(Circuit {
            child,
            port,
            _data_dir: data_dir,
        })
    }

    /// Spawn `n` circuits concurrently. If any fails, every circuit that
    /// did come up is killed and the aggregated error lists each failure.
    pub async fn create_many(n: usize) -> Result<Vec<Circuit>> {
        let mut set = JoinSet::new();
        for _ in 0..n {
            set.spawn(Circuit::create());
        }

        let mut circuits = Vec::with_capacity(n);
        let mut failures: Vec<String> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(circuit)) => circuits.push(circuit),
                Ok(Err(e)) => failures.push(format!("{:#}", e)),
                Err(e) => failures.push(format!("circuit task failed: {}", e)),
            }
        }

        if !failures.is_empty() {
            for circuit in circuits {
                circuit.close().await;
            }
            bail!(
                "failed to create {} of {} circuit(s): {}",
                failures.len(),
                n,
                failures.join("; ")
            );
        }
        Ok(circuits)
    }

    /// SOCKS listener port of this circuit.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// HTTP client routing every request through this circuit.
    pub fn http_client(&self) -> HttpClient {
        HttpClient::socks5(self.port)
    }

    /// Kill the proxy process and wait for it to exit.
    pub async fn close(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(port = self.port, error = %e, "circuit already gone");
        }
    }
}

/// Scan the child's stdout for the bootstrap marker, echoing every line at
/// debug level. Returns false when the stream ends first (the child died
/// or lost the port race).
async fn wait_for_bootstrap<R>(lines: &mut Lines<R>, port: u16) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = lines
        .next_line()
        .await
        .context("cannot read circuit output")?
    {
        tracing::debug!(port, "{}", line);
        if line.contains(BOOTSTRAP_MARKER) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Bind a loopback socket to port 0 to discover a free port, then release
/// it for the child. Inherently racy; `create` retries when the child
/// loses the race.
fn free_socks_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("localhost:0")
        .context("cannot find free port to listen on")?;
    let port = listener
        .local_addr()
        .context("cannot read bound address")?
        .port();
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_scan_finds_marker() {
        let output = b"May 01 12:00:01 [notice] Bootstrapped 10% (conn_done)\n\
May 01 12:00:02 [notice] Bootstrapped 75% (loading_descriptors)\n\
May 01 12:00:03 [notice] Bootstrapped 100% (done): Done\n\
May 01 12:00:04 [notice] new circuit established\n";
        let mut lines = BufReader::new(&output[..]).lines();
        assert!(wait_for_bootstrap(&mut lines, 9050).await.unwrap());
        // The remainder stays readable for the drain task.
        let next = lines.next_line().await.unwrap().unwrap();
        assert!(next.contains("new circuit"));
    }

    #[tokio::test]
    async fn bootstrap_scan_reports_early_exit() {
        let output = b"May 01 12:00:01 [warn] Could not bind to 127.0.0.1:9050\n";
        let mut lines = BufReader::new(&output[..]).lines();
        assert!(!wait_for_bootstrap(&mut lines, 9050).await.unwrap());
    }

    #[test]
    fn free_ports_are_distinct_loopback_ports() {
        let a = free_socks_port().unwrap();
        let b = free_socks_port().unwrap();
        assert!(a > 0);
        assert!(b > 0);
    }
}
