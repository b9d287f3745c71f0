use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use loam_core::Platform;

/// At most `max_requests` starts within any `window_secs` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimit {
    pub fn default_for(platform: Platform) -> Self {
        let max_requests = match platform {
            Platform::Video => 10,
            Platform::Highlight => 3,
            Platform::ForumThread => 5,
            Platform::MicroblogThread => 3,
            Platform::ChatTranscript => 3,
        };
        Self {
            max_requests,
            window_secs: 60,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Sliding-window limiter: remembers when each recent permit was handed out.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    recent: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            max_requests: limit.max_requests.max(1) as usize,
            window: limit.window(),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until starting one more request keeps the window under its cap.
    pub async fn acquire(&self) {
        loop {
            let mut recent = self.recent.lock().await;
            let now = Instant::now();
            while recent
                .front()
                .is_some_and(|started| now.duration_since(*started) >= self.window)
            {
                recent.pop_front();
            }

            if recent.len() < self.max_requests {
                recent.push_back(now);
                return;
            }

            let wake_at = match recent.front() {
                Some(oldest) => *oldest + self.window,
                None => now,
            };
            drop(recent);
            tokio::time::sleep_until(wake_at).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fourth_request_waits_for_the_window_to_slide() {
        let limiter = SlidingWindowLimiter::new(RateLimit {
            max_requests: 3,
            window_secs: 60,
        });
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn permits_spaced_across_windows_never_wait() {
        let limiter = SlidingWindowLimiter::new(RateLimit {
            max_requests: 1,
            window_secs: 10,
        });
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        let before = Instant::now();
        limiter.acquire().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[test]
    fn platform_defaults() {
        assert_eq!(RateLimit::default_for(Platform::Video).max_requests, 10);
        assert_eq!(RateLimit::default_for(Platform::ForumThread).max_requests, 5);
        assert_eq!(RateLimit::default_for(Platform::ChatTranscript).window_secs, 60);
    }
}
