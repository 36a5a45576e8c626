//! Sliding-window async throttler

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::{RateLimit, TaskLog, ThrottlerConfig};
use crate::error::{Result, SyncError};
use crate::metrics;

/// Proof that a request was admitted
#[derive(Debug, Clone)]
pub struct Admission {
    path: String,
    admitted_at: Instant,
    waited: Duration,
    throttled: bool,
}

impl Admission {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn admitted_at(&self) -> Instant {
        self.admitted_at
    }

    /// Time spent waiting for capacity
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// False when the path has no configured limit
    pub fn is_throttled(&self) -> bool {
        self.throttled
    }
}

#[derive(Debug)]
struct Inner {
    limits: HashMap<String, RateLimit>,
    task_logs: Mutex<VecDeque<TaskLog>>,
    safety_margin: Duration,
    retry_interval: Duration,
    stopped: AtomicBool,
}

/// Gates outbound calls against per-path sliding-window limits.
///
/// Clones share the task log and the stop signal.
#[derive(Debug, Clone)]
pub struct AsyncThrottler {
    inner: Arc<Inner>,
}

impl AsyncThrottler {
    /// Build a throttler, rejecting limits that could never admit a request
    pub fn new(config: ThrottlerConfig) -> Result<Self> {
        if config.retry_interval.is_zero() {
            return Err(SyncError::Config("retry interval must be positive".to_string()));
        }

        let mut limits = HashMap::with_capacity(config.rate_limits.len());
        for mut limit in config.rate_limits {
            if let Some(pct) = config.limits_share_pct {
                limit.limit = share_of(limit.limit, pct);
            }
            if limits.contains_key(&limit.path) {
                return Err(invalid(&limit.path, "duplicate limit"));
            }
            limits.insert(limit.path.clone(), limit);
        }

        for limit in limits.values() {
            validate(limit, &limits)?;
        }

        info!(
            limits = limits.len(),
            retry_interval_ms = config.retry_interval.as_millis() as u64,
            safety_margin_ms = config.safety_margin.as_millis() as u64,
            "Throttler configured"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                limits,
                task_logs: Mutex::new(VecDeque::new()),
                safety_margin: config.safety_margin,
                retry_interval: config.retry_interval,
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Wait until `path` has capacity and record the admission.
    ///
    /// Returns [`SyncError::Cancelled`] once [`stop`](Self::stop) has been called.
    pub async fn acquire(&self, path: &str) -> Result<Admission> {
        let requested_at = Instant::now();
        let Some(limit) = self.inner.limits.get(path) else {
            warn!(path, "No rate limit configured for path, admitting unthrottled");
            self.check_stopped()?;
            return Ok(Admission {
                path: path.to_string(),
                admitted_at: requested_at,
                waited: Duration::ZERO,
                throttled: false,
            });
        };
        let related = self.related_limits(limit);

        let mut waiting = false;
        loop {
            self.check_stopped()?;

            {
                let mut logs = self.inner.task_logs.lock().await;
                let now = Instant::now();
                self.flush(&mut logs, now);

                let has_capacity = related
                    .iter()
                    .all(|(related, weight)| occupancy(&logs, &related.path) + weight <= related.limit);

                if has_capacity {
                    for (related, weight) in &related {
                        logs.push_back(TaskLog {
                            timestamp: now,
                            limit_id: related.path.clone(),
                            weight: *weight,
                        });
                    }
                    metrics::global()
                        .throttle_admissions
                        .with_label_values(&[path])
                        .inc();
                    return Ok(Admission {
                        path: path.to_string(),
                        admitted_at: now,
                        waited: now.duration_since(requested_at),
                        throttled: true,
                    });
                }
            }

            if !waiting {
                debug!(path, "Rate limit reached, waiting for capacity");
                metrics::global().throttle_waits.with_label_values(&[path]).inc();
                waiting = true;
            }
            sleep(self.inner.retry_interval).await;
        }
    }

    /// Run `request` once `path` has capacity
    pub async fn execute<F, T>(&self, path: &str, request: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let _admission = self.acquire(path).await?;
        Ok(request.await)
    }

    /// Signal every pending and future `acquire` to return a cancellation
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            info!("Throttler stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn retry_interval(&self) -> Duration {
        self.inner.retry_interval
    }

    pub fn rate_limit(&self, path: &str) -> Option<&RateLimit> {
        self.inner.limits.get(path)
    }

    /// Weight currently counted against `path`
    pub async fn occupancy(&self, path: &str) -> u32 {
        let mut logs = self.inner.task_logs.lock().await;
        self.flush(&mut logs, Instant::now());
        occupancy(&logs, path)
    }

    fn check_stopped(&self) -> Result<()> {
        if self.is_stopped() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The limit itself followed by its linked pools, each with the weight charged
    fn related_limits<'a>(&'a self, limit: &'a RateLimit) -> Vec<(&'a RateLimit, u32)> {
        let mut related = vec![(limit, limit.weight)];
        for linked in &limit.linked_limits {
            if let Some(pool) = self.inner.limits.get(&linked.limit_id) {
                related.push((pool, linked.weight));
            }
        }
        related
    }

    fn effective_window(&self, limit: &RateLimit) -> Duration {
        limit.window + limit.safety_margin.unwrap_or(self.inner.safety_margin)
    }

    /// Drop logs that have aged out of their limit's window
    fn flush(&self, logs: &mut VecDeque<TaskLog>, now: Instant) {
        logs.retain(|log| match self.inner.limits.get(&log.limit_id) {
            Some(limit) => now.duration_since(log.timestamp) < self.effective_window(limit),
            None => false,
        });
    }
}

fn occupancy(logs: &VecDeque<TaskLog>, limit_id: &str) -> u32 {
    logs.iter()
        .filter(|log| log.limit_id == limit_id)
        .map(|log| log.weight)
        .sum()
}

fn share_of(limit: u32, pct: Decimal) -> u32 {
    let shared = (Decimal::from(limit) * pct / Decimal::ONE_HUNDRED).floor();
    shared.to_u32().unwrap_or(limit).max(1)
}

fn validate(limit: &RateLimit, limits: &HashMap<String, RateLimit>) -> Result<()> {
    if limit.limit == 0 {
        return Err(invalid(&limit.path, "limit must be at least 1"));
    }
    if limit.window.is_zero() {
        return Err(invalid(&limit.path, "window must be positive"));
    }
    if limit.weight == 0 || limit.weight > limit.limit {
        return Err(invalid(&limit.path, "weight must be between 1 and the limit"));
    }
    for linked in &limit.linked_limits {
        match limits.get(&linked.limit_id) {
            Some(pool) if linked.weight <= pool.limit => {}
            Some(_) => return Err(invalid(&limit.path, "linked weight exceeds the pool limit")),
            None => {
                return Err(invalid(
                    &limit.path,
                    &format!("linked limit {} is not configured", linked.limit_id),
                ))
            }
        }
    }
    Ok(())
}

fn invalid(path: &str, reason: &str) -> SyncError {
    SyncError::InvalidRateLimit {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::assert_pending;

    const ORDERS: &str = "/orders";

    fn throttler(limits: Vec<RateLimit>) -> AsyncThrottler {
        AsyncThrottler::new(ThrottlerConfig::new(limits)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_spread_over_windows() {
        let throttler = throttler(vec![RateLimit::new(ORDERS, 2, Duration::from_secs(1))
            .with_safety_margin(Duration::from_millis(100))]);

        let start = Instant::now();
        let mut admitted = Vec::new();
        for _ in 0..5 {
            throttler.acquire(ORDERS).await.unwrap();
            admitted.push(start.elapsed());
        }

        assert_eq!(admitted[0], Duration::ZERO);
        assert_eq!(admitted[1], Duration::ZERO);
        for at in &admitted[2..] {
            assert!(*at >= Duration::from_millis(900), "admitted too early at {:?}", at);
        }
        assert!(admitted[4] >= Duration::from_millis(1900));

        for at in &admitted {
            let in_window = admitted
                .iter()
                .filter(|other| **other <= *at && *at - **other < Duration::from_secs(1))
                .count();
            assert!(in_window <= 2, "{} admissions in window ending {:?}", in_window, at);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_admit_exactly_limit() {
        let throttler = throttler(vec![RateLimit::new(ORDERS, 2, Duration::from_secs(1))]);
        let admitted = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let throttler = throttler.clone();
            let admitted = admitted.clone();
            tokio::spawn(async move {
                throttler.acquire(ORDERS).await.unwrap();
                admitted.fetch_add(1, Ordering::SeqCst);
            });
        }

        sleep(Duration::from_millis(10)).await;
        assert_eq!(admitted.load(Ordering::SeqCst), 2);

        sleep(Duration::from_millis(1200)).await;
        assert_eq!(admitted.load(Ordering::SeqCst), 4);

        sleep(Duration::from_millis(1200)).await;
        assert_eq!(admitted.load(Ordering::SeqCst), 5);
        throttler.stop();
    }

    #[tokio::test]
    async fn test_acquire_waits_when_over_capacity() {
        let throttler = throttler(vec![RateLimit::new(ORDERS, 1, Duration::from_secs(5))]);
        throttler.acquire(ORDERS).await.unwrap();
        assert_eq!(throttler.occupancy(ORDERS).await, 1);

        let mut pending = tokio_test::task::spawn(throttler.acquire(ORDERS));
        assert_pending!(pending.poll());
        throttler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_blocked_callers() {
        let throttler = throttler(vec![RateLimit::new(ORDERS, 1, Duration::from_secs(60))]);
        throttler.acquire(ORDERS).await.unwrap();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let throttler = throttler.clone();
                tokio::spawn(async move { throttler.acquire(ORDERS).await })
            })
            .collect();

        sleep(Duration::from_millis(250)).await;
        let stopped_at = Instant::now();
        throttler.stop();

        for waiter in waiters {
            let result = waiter.await.unwrap();
            assert!(matches!(result, Err(SyncError::Cancelled)));
        }
        assert!(stopped_at.elapsed() <= throttler.retry_interval());
        assert!(matches!(throttler.acquire(ORDERS).await, Err(SyncError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_weighted_requests() {
        let throttler = throttler(vec![RateLimit::new(ORDERS, 5, Duration::from_secs(5)).with_weight(2)]);
        throttler.acquire(ORDERS).await.unwrap();
        throttler.acquire(ORDERS).await.unwrap();
        assert_eq!(throttler.occupancy(ORDERS).await, 4);

        let mut third = tokio_test::task::spawn(throttler.acquire(ORDERS));
        assert_pending!(third.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_linked_pool_is_shared() {
        let throttler = throttler(vec![
            RateLimit::new("POOL", 1, Duration::from_secs(5)),
            RateLimit::new("/a", 5, Duration::from_secs(5)).with_linked_limit("POOL", 1),
            RateLimit::new("/b", 5, Duration::from_secs(5)).with_linked_limit("POOL", 1),
        ]);

        throttler.acquire("/a").await.unwrap();
        assert_eq!(throttler.occupancy("POOL").await, 1);

        let mut blocked = tokio_test::task::spawn(throttler.acquire("/b"));
        assert_pending!(blocked.poll());
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_throttled() {
        let throttler = throttler(vec![RateLimit::new(ORDERS, 1, Duration::from_secs(5))]);
        let admission = throttler.acquire("/unknown").await.unwrap();
        assert!(!admission.is_throttled());

        let value = throttler.execute(ORDERS, async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_limits_share_pct() {
        let config = ThrottlerConfig {
            limits_share_pct: Some(dec!(55)),
            ..ThrottlerConfig::new(vec![
                RateLimit::new("/big", 10, Duration::from_secs(5)),
                RateLimit::new("/small", 1, Duration::from_secs(5)),
            ])
        };
        let throttler = AsyncThrottler::new(config).unwrap();
        assert_eq!(throttler.rate_limit("/big").unwrap().limit, 5);
        assert_eq!(throttler.rate_limit("/small").unwrap().limit, 1);
    }

    #[test]
    fn test_invalid_limits_fail_fast() {
        let zero = AsyncThrottler::new(ThrottlerConfig::new(vec![RateLimit::new(
            ORDERS,
            0,
            Duration::from_secs(1),
        )]));
        assert!(matches!(zero, Err(SyncError::InvalidRateLimit { .. })));

        let unknown_pool = AsyncThrottler::new(ThrottlerConfig::new(vec![RateLimit::new(
            ORDERS,
            1,
            Duration::from_secs(1),
        )
        .with_linked_limit("MISSING", 1)]));
        assert!(matches!(unknown_pool, Err(SyncError::InvalidRateLimit { .. })));

        let duplicate = AsyncThrottler::new(ThrottlerConfig::new(vec![
            RateLimit::new(ORDERS, 1, Duration::from_secs(1)),
            RateLimit::new(ORDERS, 2, Duration::from_secs(1)),
        ]));
        assert!(matches!(duplicate, Err(SyncError::InvalidRateLimit { .. })));
    }
}
