//! Connectivity pre-checks run before a synchronous network attempt.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::request::Request;

/// Timeout for the active reachability ping.
const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Source of link-state and reachability information.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Returns whether the network link is up.
    fn link_up(&self) -> bool;

    /// Actively checks that a remote host answers.
    async fn ping(&self) -> bool;
}

/// Runs the checks a request asks for. Returns `true` when the network may be used.
pub async fn is_reachable(probe: &dyn ConnectivityProbe, request: &Request) -> bool {
    if !request.connectivity_check() {
        return true;
    }
    if !probe.link_up() {
        debug!(url = %request.url(), "link down, skipping network attempt");
        return false;
    }
    if request.connectivity_ping() && !probe.ping().await {
        debug!(url = %request.url(), "reachability ping failed, skipping network attempt");
        return false;
    }
    true
}

/// Link state reported by the host, plus an optional HEAD ping target.
///
/// The host flips [`set_link_up`](Self::set_link_up) when its network
/// state changes; the ping issues a HEAD request to `ping_url`.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    link_up: Arc<AtomicBool>,
    ping_url: Option<String>,
    client: Client,
}

impl NetworkMonitor {
    /// Creates a monitor that starts with the link up.
    #[must_use]
    pub fn new(ping_url: Option<String>) -> Self {
        Self {
            link_up: Arc::new(AtomicBool::new(true)),
            ping_url,
            client: Client::new(),
        }
    }

    /// Records a link-state change.
    pub fn set_link_up(&self, up: bool) {
        self.link_up.store(up, Ordering::SeqCst);
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl ConnectivityProbe for NetworkMonitor {
    fn link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> bool {
        let Some(url) = &self.ping_url else {
            return true;
        };
        match self.client.head(url).timeout(PING_TIMEOUT).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(error) => {
                warn!(url = %url, error = %error, "reachability ping failed");
                false
            }
        }
    }
}
