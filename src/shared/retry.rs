//! Exponential backoff with jitter, shared by the gateway buffer, the
//! outbound worker, the ingestion worker and the automation connectors.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BackoffSchedule {
    pub base: Duration,
    pub factor: f64,
    /// Jitter ratio applied symmetrically, e.g. 0.25 for plus/minus 25%.
    pub jitter: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            jitter: 0.25,
            cap: Duration::from_secs(30),
            max_attempts: 6,
        }
    }
}

impl BackoffSchedule {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before the given attempt (1-based), jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let exp = self.factor.powi(attempt as i32 - 1);
        let raw = self.base.as_secs_f64() * exp;
        let capped = raw.min(self.cap.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }

    /// Upper bound of the whole schedule, used to size dedupe windows.
    pub fn worst_case_window(&self) -> Duration {
        let mut total = Duration::ZERO;
        for attempt in 1..=self.max_attempts {
            let exp = self.factor.powi(attempt as i32 - 1);
            let raw = self.base.as_secs_f64() * exp;
            let capped = raw.min(self.cap.as_secs_f64());
            total += Duration::from_secs_f64(capped * (1.0 + self.jitter));
        }
        total
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Run `op` until it succeeds or the schedule is exhausted. `retryable`
/// decides whether a given error is worth another attempt.
pub async fn retry_async<T, E, F, Fut, P>(
    schedule: &BackoffSchedule,
    mut op: F,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if schedule.exhausted(attempt) || !retryable(&err) {
                    return Err(err);
                }
                tokio::time::sleep(schedule.delay_for(attempt)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_and_respect_cap() {
        let schedule = BackoffSchedule {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(schedule.delay_for(1), Duration::from_millis(500));
        assert_eq!(schedule.delay_for(2), Duration::from_secs(1));
        assert_eq!(schedule.delay_for(3), Duration::from_secs(2));
        // 500ms * 2^9 would be 256s; the cap clamps it.
        assert_eq!(schedule.delay_for(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let schedule = BackoffSchedule::default();
        for _ in 0..100 {
            let delay = schedule.delay_for(2).as_secs_f64();
            assert!((0.75..=1.25).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn exhaustion_after_max_attempts() {
        let schedule = BackoffSchedule::default().with_max_attempts(3);
        assert!(!schedule.exhausted(2));
        assert!(schedule.exhausted(3));
    }

    #[tokio::test]
    async fn retry_async_stops_on_non_retryable() {
        let schedule = BackoffSchedule {
            base: Duration::from_millis(1),
            jitter: 0.0,
            ..Default::default()
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry_async(
            &schedule,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent") }
            },
            |_| false,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_async_eventually_succeeds() {
        let schedule = BackoffSchedule {
            base: Duration::from_millis(1),
            jitter: 0.0,
            ..Default::default()
        };
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_async(
            &schedule,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(n)
                    }
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
