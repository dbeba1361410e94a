//! Hostname resolution as a cancellable background task.
//!
//! Lookups run on the runtime's blocking-aware resolver via
//! `tokio::net::lookup_host`; the handle can be dropped or aborted at any
//! point (user cancels login, redirect arrives first) without leaking the
//! task or delivering a stale result.

use std::net::SocketAddr;

use tokio::net::lookup_host;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{ProtocolError, Result};

/// An in-flight lookup. Dropping it aborts the background task.
pub struct Resolution {
    task: JoinHandle<()>,
    rx: oneshot::Receiver<Result<Vec<SocketAddr>>>,
}

impl Resolution {
    /// Start resolving `host:port` in the background.
    pub fn start(host: String, port: u16) -> Self {
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let outcome = lookup_host((host.as_str(), port))
                .await
                .map(|addrs| addrs.collect::<Vec<_>>())
                .map_err(|e| ProtocolError::Resolve(format!("{host}: {e}")));
            if let Ok(addrs) = &outcome {
                debug!(host = %host, count = addrs.len(), "resolved");
            }
            let _ = tx.send(outcome);
        });
        Self { task, rx }
    }

    /// Wait for the addresses. An empty answer is an error.
    pub async fn wait(mut self) -> Result<Vec<SocketAddr>> {
        // The Drop impl forbids moving the receiver out; await it in place.
        let addrs = (&mut self.rx)
            .await
            .map_err(|_| ProtocolError::Resolve("lookup task dropped".into()))??;
        if addrs.is_empty() {
            return Err(ProtocolError::Resolve("no addresses".into()));
        }
        Ok(addrs)
    }

    /// Abort the lookup without waiting for it.
    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for Resolution {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Resolve and return the first address, preferring IPv4 since the wire
/// format only carries 4-byte addresses in redirects.
pub async fn resolve_first(host: &str, port: u16) -> Result<SocketAddr> {
    // Literal addresses skip the task entirely.
    if let Ok(addr) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(addr, port));
    }
    let addrs = Resolution::start(host.to_owned(), port).wait().await?;
    Ok(addrs
        .iter()
        .find(|a| a.is_ipv4())
        .copied()
        .unwrap_or(addrs[0]))
}
