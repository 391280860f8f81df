//! Background reachability sampling of the remote signal store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::Url;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Latest known reachability of the remote store.
///
/// Clones share the same flag. Consumers check [`is_online`](Self::is_online)
/// before any network call and take their offline path when it is false.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    online: Arc<AtomicBool>,
    last_warning: Arc<Mutex<Option<Instant>>>,
    warn_cooldown: Duration,
}

impl ConnectivityMonitor {
    /// New monitor, optimistic until the first sample says otherwise.
    pub fn new(warn_cooldown: Duration) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(true)),
            last_warning: Arc::new(Mutex::new(None)),
            warn_cooldown,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            if online {
                info!("Connectivity restored");
            } else {
                warn!("Connectivity lost");
            }
        }
    }

    /// Log an offline warning at most once per cooldown window.
    ///
    /// Returns whether a warning was emitted.
    pub fn warn_offline(&self, context: &str) -> bool {
        let mut last = self.last_warning.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if let Some(at) = *last {
            if now.duration_since(at) < self.warn_cooldown {
                return false;
            }
        }
        *last = Some(now);
        warn!(context, "Offline, skipping remote call");
        true
    }

    /// Sample `host:port` on a fixed period until `stop` is set.
    pub fn spawn(&self, host: String, port: u16, period: Duration, stop: Arc<AtomicBool>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            while !stop.load(Ordering::SeqCst) {
                ticker.tick().await;
                let reachable = probe(&host, port).await;
                debug!(host = %host, reachable, "Connectivity sample");
                monitor.set_online(reachable);
            }
        })
    }
}

async fn probe(host: &str, port: u16) -> bool {
    matches!(
        timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Host and port to probe for a URL; the port defaults from the scheme.
pub fn endpoint_of(url: &str) -> Option<(String, u16)> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let port = parsed.port_or_known_default()?;
    // IPv6 literals come back bracketed; the socket API wants the bare address.
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some((host.to_string(), port))
}
