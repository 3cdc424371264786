/**
 * REQUIREMENT: Per-user sliding-window event limits: at most N events per W ms,
 * with a W ms block after an overrun
 * PURPOSE: Local, approximate rate limiting for session event traffic
 * Limiter state is per node; it is not synchronized across the cluster.
 */
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{CollabError, CollabResult};

#[derive(Debug, Default)]
struct UserWindow {
    events: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

/// Sliding-window rate limiter keyed by user id
#[derive(Debug)]
pub struct RateLimiter {
    max_events: usize,
    window: Duration,
    users: Mutex<HashMap<String, UserWindow>>,
}

impl RateLimiter {
    pub fn new(max_events: u32, window_ms: u64) -> Self {
        Self {
            max_events: max_events as usize,
            window: Duration::from_millis(window_ms),
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Account one event for `user_id`; `Err(RateLimited)` once the budget is spent
    pub fn check(&self, user_id: &str) -> CollabResult<()> {
        let mut users = self.users.lock().unwrap();
        let entry = users.entry(user_id.to_string()).or_default();
        let now = Instant::now();

        if let Some(until) = entry.blocked_until {
            if now < until {
                return Err(CollabError::RateLimited);
            }
            entry.blocked_until = None;
            entry.events.clear();
        }

        while let Some(front) = entry.events.front() {
            if now.duration_since(*front) > self.window {
                entry.events.pop_front();
            } else {
                break;
            }
        }

        if entry.events.len() >= self.max_events {
            entry.blocked_until = Some(now + self.window);
            return Err(CollabError::RateLimited);
        }

        entry.events.push_back(now);
        Ok(())
    }

    /// Drop limiter state on disconnect
    pub fn remove(&self, user_id: &str) {
        self.users.lock().unwrap().remove(user_id);
    }
}
