//! Application state and rate limiting.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use nextmove_engine::{
    Engine, SignalBoard, StaticDirectory, StaticOpportunitySource, StaticReadiness,
};
use nextmove_storage::InMemoryStorage;
use tokio::sync::Mutex;

use super::RATE_LIMIT_WINDOW_SECS;

/// Per-IP request tracker: (request count, window start time).
type IpTracker = HashMap<IpAddr, (u64, Instant)>;

/// Fixed-window per-IP rate limiter.
pub(crate) struct RateLimiter {
    tracker: Mutex<IpTracker>,
    pub(crate) max_requests: u64,
}

impl RateLimiter {
    pub(crate) fn new(max_requests: u64) -> Self {
        Self {
            tracker: Mutex::new(HashMap::new()),
            max_requests,
        }
    }

    /// `Err(retry_after_secs)` once the IP has used up its window.
    pub(crate) async fn check(&self, ip: IpAddr) -> Result<(), u64> {
        let mut tracker = self.tracker.lock().await;
        let now = Instant::now();
        let entry = tracker.entry(ip).or_insert((0, now));

        let elapsed = now.duration_since(entry.1).as_secs();
        if elapsed >= RATE_LIMIT_WINDOW_SECS {
            *entry = (0, now);
        }

        entry.0 += 1;
        if entry.0 > self.max_requests {
            Err(RATE_LIMIT_WINDOW_SECS.saturating_sub(elapsed))
        } else {
            Ok(())
        }
    }
}

/// Feeds the API pushes into the engine. `source` and `readiness` are
/// `None` when they are pulled from the storefront platform instead.
pub(crate) struct Feeds {
    pub(crate) source: Option<Arc<StaticOpportunitySource>>,
    pub(crate) readiness: Option<Arc<StaticReadiness>>,
    pub(crate) directory: Arc<StaticDirectory>,
    pub(crate) signals: Arc<SignalBoard>,
}

/// Application state shared across request handlers.
pub(crate) struct AppState {
    pub(crate) engine: Arc<Engine<InMemoryStorage>>,
    pub(crate) feeds: Feeds,
    pub(crate) rate_limiter: RateLimiter,
    /// `None` disables authentication.
    pub(crate) api_key: Option<String>,
}
