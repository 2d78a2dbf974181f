//! A small HTTP health prober: a single GET with a 200 means ready,
//! anything else — a non-200 status or a transport error — means not
//! ready yet.

use std::time::Duration;

use tracing::{debug, trace};
use url::Url;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Issues GET requests against a configured health-check URL.
#[derive(Debug, Clone)]
pub struct HealthProber {
    client: reqwest::Client,
}

impl HealthProber {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// One-shot probe: true only on a 200 response within `timeout`.
    pub async fn check(&self, target: &Url, timeout: Duration) -> bool {
        match self.client.get(target.clone()).timeout(timeout).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => true,
            Ok(resp) => {
                trace!(status = %resp.status(), %target, "health check returned non-200");
                false
            }
            Err(e) => {
                trace!(error = %e, %target, "health check request failed");
                false
            }
        }
    }

    /// Polls `check` on a fixed 100ms cadence until it succeeds or
    /// `timeout` has elapsed since the call started, whichever comes
    /// first. Each individual poll is itself bounded by `timeout`, so a
    /// server that accepts the connection but never responds cannot
    /// extend the overall wait past `timeout`.
    pub async fn wait_until_healthy(&self, target: &Url, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            if self.check(target, timeout).await {
                debug!(%target, "backend reported healthy");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                debug!(%target, ?timeout, "backend did not become healthy in time");
                return false;
            }
        }
    }
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the pid-file contract to answer "is the backend healthy right
/// now", for the standalone `wakeproxy healthcheck` entry point: a missing
/// pid file means no supervisor is running at all; a pid file with no
/// `:<url>` suffix means the supervisor is alive but considers the backend
/// irrelevant to health (down, and that's expected, so this is healthy);
/// a pid file with a URL defers to an actual probe of it.
pub async fn check_process_health(
    prober: &HealthProber,
    contents: Option<&wakeproxy_core::PidFileContents>,
    timeout: Duration,
) -> bool {
    match contents {
        None => false,
        Some(c) => match &c.health_check_url {
            None => true,
            Some(url) => prober.check(url, timeout).await,
        },
    }
}
