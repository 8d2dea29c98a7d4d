use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::shared::constants::{DEFAULT_GUEST_MAX_REQUESTS, DEFAULT_GUEST_WINDOW_SECS};

/// Remaining guest allowance, as reported to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub remaining: usize,
    /// Seconds until the oldest counted request leaves the window.
    pub reset: u64,
    pub total: usize,
}

/// Rolling-window request quota for guest identities.
///
/// Each guest may make `max_requests` detection requests within any
/// `window`; older timestamps are pruned on every access.
pub struct GuestQuota {
    max_requests: usize,
    window: Duration,
    usage: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl GuestQuota {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// Counts one request for `guest_id` if quota remains.
    pub fn try_acquire(&self, guest_id: &str, now: Instant) -> bool {
        let mut usage = self.lock();
        let stamps = usage.entry(guest_id.to_string()).or_default();
        prune(stamps, now, self.window);
        if stamps.len() >= self.max_requests {
            log::info!("Guest {guest_id} exceeded quota of {}", self.max_requests);
            return false;
        }
        stamps.push_back(now);
        true
    }

    pub fn remaining(&self, guest_id: &str, now: Instant) -> QuotaStatus {
        let mut usage = self.lock();
        let Some(stamps) = usage.get_mut(guest_id) else {
            return self.fresh_status();
        };
        prune(stamps, now, self.window);
        let reset = stamps
            .front()
            .map(|&oldest| (oldest + self.window).saturating_duration_since(now).as_secs())
            .unwrap_or(0);
        QuotaStatus {
            remaining: self.max_requests.saturating_sub(stamps.len()),
            reset,
            total: self.max_requests,
        }
    }

    /// Drops guests whose every request has left the window.
    pub fn prune_expired(&self, now: Instant) {
        let mut usage = self.lock();
        usage.retain(|_, stamps| {
            prune(stamps, now, self.window);
            !stamps.is_empty()
        });
    }

    pub fn tracked_guests(&self) -> usize {
        self.lock().len()
    }

    fn fresh_status(&self) -> QuotaStatus {
        QuotaStatus {
            remaining: self.max_requests,
            reset: 0,
            total: self.max_requests,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for GuestQuota {
    fn default() -> Self {
        Self::new(
            DEFAULT_GUEST_MAX_REQUESTS,
            Duration::from_secs(DEFAULT_GUEST_WINDOW_SECS),
        )
    }
}

fn prune(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = stamps.front() {
        if now.saturating_duration_since(oldest) >= window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}
