//! Retry engine
//!
//! Every remote operation runs inside a bounded retry loop: acquire a
//! connection, make one attempt, classify the failure. Transport failures
//! drop the connection and back off; "try again" backs off on the same
//! connection; everything else surfaces at once. The loop gives up with
//! `Timeout` when the budget is spent.
//!
//! Backoff starts with an immediate retry, then waits 1 s and doubles up to
//! 60 s. Sleeps never run past the deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use keel_core::{translate_with, DriverConfig, ErrorKind, HostKey, RemoteCode};

use crate::connection_cache::{Connection, ConnectionCache};

/// Retry budget and backoff shape
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Overall deadline for one call
    pub budget: Duration,
    /// Delay after the immediate retry
    pub min_delay: Duration,
    /// Delay cap
    pub max_delay: Duration,
    /// Retries before the operator gets a "still trying" notice
    pub notice_after: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DriverConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            budget: Duration::from_secs(config.retry_budget_secs),
            min_delay: Duration::from_secs(config.min_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            notice_after: config.notice_after,
        }
    }
}

/// Backoff state of one call
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    deadline: Instant,
    delay: Duration,
    retries: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        let deadline = Instant::now() + policy.budget;
        Self {
            policy,
            deadline,
            delay: Duration::ZERO,
            retries: 0,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// When the next attempt may start, or `None` once the deadline has passed
    pub fn next_wake(&mut self, now: Instant) -> Option<Instant> {
        if now >= self.deadline {
            return None;
        }

        let wake = (now + self.delay).min(self.deadline);
        self.delay = if self.delay.is_zero() {
            self.policy.min_delay
        } else {
            (self.delay * 2).min(self.policy.max_delay)
        };
        self.retries += 1;
        Some(wake)
    }
}

/// Why one attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptError {
    /// The backend rejected the request
    Remote(RemoteCode),
    /// Reattaching an open handle to a new connection failed
    Resync(RemoteCode),
    /// Already classified; surfaces unchanged
    Fatal(ErrorKind),
}

impl From<RemoteCode> for AttemptError {
    fn from(code: RemoteCode) -> Self {
        AttemptError::Remote(code)
    }
}

impl From<ErrorKind> for AttemptError {
    fn from(kind: ErrorKind) -> Self {
        AttemptError::Fatal(kind)
    }
}

/// Acquisition failures that no amount of retrying will fix
fn is_final_acquire_error(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::NotFound
            | ErrorKind::PermissionDenied
            | ErrorKind::AccessDenied
            | ErrorKind::ConfigError
            | ErrorKind::Cancelled
    )
}

enum Verdict {
    Reconnect,
    Wait,
    Fail(ErrorKind),
}

/// Shared retry loop over a connection cache
#[derive(Clone)]
pub struct RetryEngine {
    cache: Arc<ConnectionCache>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryEngine {
    pub fn new(cache: Arc<ConnectionCache>, policy: RetryPolicy) -> Self {
        Self {
            cache,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    /// An engine whose calls stop when `token` is cancelled.
    ///
    /// Pass a child of [`cancel_token`](Self::cancel_token) to keep
    /// engine-wide cancellation working.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            cache: self.cache.clone(),
            policy: self.policy.clone(),
            cancel: token,
        }
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel every call running on this engine
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Start an explicit retry loop for one call
    pub fn begin<'a>(&'a self, host: &'a HostKey, op: &'static str) -> RetryLoop<'a> {
        RetryLoop {
            engine: self,
            host,
            op,
            backoff: Backoff::new(self.policy.clone()),
        }
    }

    /// Run a single-request operation with retries
    pub async fn run<T, F, Fut>(
        &self,
        host: &HostKey,
        op: &'static str,
        mut attempt: F,
    ) -> Result<T, ErrorKind>
    where
        F: FnMut(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<T, RemoteCode>>,
    {
        let mut retry = self.begin(host, op);
        loop {
            let conn = retry.connection().await?;
            let fut = attempt(conn.clone());
            let result = retry
                .attempt(&conn, async { fut.await.map_err(AttemptError::Remote) })
                .await;
            if let Some(value) = retry.settle(&conn, result).await? {
                return Ok(value);
            }
        }
    }

    /// Like [`run`](Self::run), but "no rows found" is an empty result
    pub async fn run_listing<T, F, Fut>(
        &self,
        host: &HostKey,
        op: &'static str,
        mut attempt: F,
    ) -> Result<T, ErrorKind>
    where
        T: Default,
        F: FnMut(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<T, RemoteCode>>,
    {
        let mut retry = self.begin(host, op);
        loop {
            let conn = retry.connection().await?;
            let fut = attempt(conn.clone());
            let result = retry
                .attempt(&conn, async { fut.await.map_err(AttemptError::Remote) })
                .await;
            if let Some(value) = retry.settle_or_empty(&conn, result).await? {
                return Ok(value);
            }
        }
    }
}

/// One call's retry loop, driven step by step
///
/// `connection` → `attempt` → `settle`, repeated until `settle` yields a
/// value or an error. Futures given to `attempt` must take the session lock
/// themselves so it is released before the loop invalidates anything.
pub struct RetryLoop<'a> {
    engine: &'a RetryEngine,
    host: &'a HostKey,
    op: &'static str,
    backoff: Backoff,
}

impl<'a> RetryLoop<'a> {
    pub fn host(&self) -> &HostKey {
        self.host
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.engine.cache
    }

    /// A connection for the next attempt, backing off while acquisition fails
    pub async fn connection(&mut self) -> Result<Arc<Connection>, ErrorKind> {
        loop {
            let cancel = &self.engine.cancel;
            if cancel.is_cancelled() {
                return Err(ErrorKind::Cancelled);
            }

            let acquired = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ErrorKind::Cancelled),
                result = self.engine.cache.acquire(self.host) => result,
            };

            match acquired {
                Ok(conn) => return Ok(conn),
                Err(kind) if is_final_acquire_error(kind) => return Err(kind),
                Err(kind) => {
                    debug!("{} on {}: couldn't get a connection: {}", self.op, self.host, kind);
                    self.backoff().await?;
                }
            }
        }
    }

    /// Run one attempt, racing it against cancellation
    pub async fn attempt<T, Fut>(&self, conn: &Connection, fut: Fut) -> Result<T, AttemptError>
    where
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let outcome = tokio::select! {
            biased;
            _ = self.engine.cancel.cancelled() => None,
            result = fut => Some(result),
        };

        match outcome {
            Some(result) => result,
            None => {
                // The session may be mid-request
                debug!("{} on {} cancelled", self.op, self.host);
                self.engine
                    .cache
                    .invalidate_generation(self.host, conn.generation())
                    .await;
                Err(AttemptError::Fatal(ErrorKind::Cancelled))
            }
        }
    }

    /// Classify an attempt's outcome: `Some` to finish, `None` to go again
    pub async fn settle<T>(
        &mut self,
        conn: &Connection,
        result: Result<T, AttemptError>,
    ) -> Result<Option<T>, ErrorKind> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) => self.recover(conn, err).await.map(|()| None),
        }
    }

    /// As [`settle`](Self::settle), but "no rows found" yields an empty value
    pub async fn settle_or_empty<T: Default>(
        &mut self,
        conn: &Connection,
        result: Result<T, AttemptError>,
    ) -> Result<Option<T>, ErrorKind> {
        match result {
            Err(AttemptError::Remote(code)) if code.is_no_rows() => Ok(Some(T::default())),
            other => self.settle(conn, other).await,
        }
    }

    async fn recover(&mut self, conn: &Connection, err: AttemptError) -> Result<(), ErrorKind> {
        match self.verdict(err) {
            Verdict::Reconnect => {
                self.engine
                    .cache
                    .invalidate_generation(self.host, conn.generation())
                    .await;
                self.backoff().await
            }
            Verdict::Wait => self.backoff().await,
            Verdict::Fail(kind) => Err(kind),
        }
    }

    fn verdict(&self, err: AttemptError) -> Verdict {
        let backend = self.engine.cache.backend();
        match err {
            AttemptError::Fatal(kind) => Verdict::Fail(kind),
            AttemptError::Remote(code) => {
                let kind = translate_with(code, |c| backend.errno_for(c));
                debug!("{} on {} failed: {} ({})", self.op, self.host, kind, code);
                if kind.requires_reconnect() {
                    Verdict::Reconnect
                } else if kind == ErrorKind::TryAgain {
                    Verdict::Wait
                } else {
                    Verdict::Fail(kind)
                }
            }
            AttemptError::Resync(code) => {
                let kind = translate_with(code, |c| backend.errno_for(c));
                debug!("{} on {}: reopen failed: {} ({})", self.op, self.host, kind, code);
                if kind.is_semantic() {
                    Verdict::Fail(kind)
                } else {
                    Verdict::Reconnect
                }
            }
        }
    }

    async fn backoff(&mut self) -> Result<(), ErrorKind> {
        let Some(wake) = self.backoff.next_wake(Instant::now()) else {
            warn!(
                "gave up on {} on {} after {} retries",
                self.op,
                self.host,
                self.backoff.retries()
            );
            return Err(ErrorKind::Timeout);
        };

        tokio::select! {
            biased;
            _ = self.engine.cancel.cancelled() => return Err(ErrorKind::Cancelled),
            _ = sleep_until(wake) => {}
        }

        if self.backoff.retries() > self.engine.policy.notice_after {
            warn!(
                "still trying to {} on {} (retry {})",
                self.op,
                self.host,
                self.backoff.retries()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_cache::CacheOptions;
    use crate::memory::{MemoryBackend, Op};
    use parking_lot::Mutex;

    fn host() -> HostKey {
        HostKey::new("data.example.org", 1247)
    }

    fn engine_for(backend: &MemoryBackend) -> RetryEngine {
        let cache = ConnectionCache::new(Arc::new(backend.clone()), CacheOptions::default());
        RetryEngine::new(Arc::new(cache), RetryPolicy::default())
    }

    fn again() -> RemoteCode {
        RemoteCode::from_errno(libc::EAGAIN)
    }

    #[test]
    fn test_backoff_delays() {
        let start = Instant::now();
        let mut backoff = Backoff::new(RetryPolicy::default());
        let mut now = start;
        let mut offsets = Vec::new();
        while let Some(wake) = backoff.next_wake(now) {
            offsets.push((wake - start).as_secs());
            now = wake;
        }
        assert_eq!(offsets, vec![0, 1, 3, 7, 15, 31, 63, 123, 150]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_again_times_out_at_budget() {
        let engine = engine_for(&MemoryBackend::new());
        let start = Instant::now();
        let attempts = Mutex::new(Vec::new());

        let result: Result<(), ErrorKind> = engine
            .run(&host(), "stat", |_conn| {
                attempts.lock().push((Instant::now() - start).as_secs());
                async { Err(again()) }
            })
            .await;

        assert_eq!(result, Err(ErrorKind::Timeout));
        assert_eq!(Instant::now() - start, Duration::from_secs(150));
        assert_eq!(
            *attempts.lock(),
            vec![0, 0, 1, 3, 7, 15, 31, 63, 123, 150]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_again_keeps_connection() {
        let backend = MemoryBackend::new();
        let engine = engine_for(&backend);
        let mut failures = 3;

        let value = engine
            .run(&host(), "stat", |_conn| {
                let result = if failures > 0 { Err(again()) } else { Ok(42) };
                failures -= 1;
                async move { result }
            })
            .await;

        assert_eq!(value, Ok(42));
        assert_eq!(backend.count(Op::Connect), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_reconnects() {
        let backend = MemoryBackend::new();
        let engine = engine_for(&backend);
        let generations = Mutex::new(Vec::new());

        let value = engine
            .run(&host(), "stat", |conn| {
                let mut seen = generations.lock();
                seen.push(conn.generation());
                let result = if seen.len() < 3 {
                    Err(RemoteCode::from_errno(libc::ECONNRESET))
                } else {
                    Ok("done")
                };
                async move { result }
            })
            .await;

        assert_eq!(value, Ok("done"));
        let seen = generations.lock();
        assert!(seen.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(backend.count(Op::Connect), 3);
        assert_eq!(backend.count(Op::Disconnect), 2);
    }

    #[tokio::test]
    async fn test_semantic_errors_surface_immediately() {
        let backend = MemoryBackend::new();
        let engine = engine_for(&backend);
        let mut calls = 0;

        let result: Result<(), ErrorKind> = engine
            .run(&host(), "stat", |_conn| {
                calls += 1;
                async { Err(RemoteCode::from_errno(libc::EACCES)) }
            })
            .await;

        assert_eq!(result, Err(ErrorKind::AccessDenied));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_no_rows_is_not_found_unless_listing() {
        let engine = engine_for(&MemoryBackend::new());

        let result: Result<Vec<String>, ErrorKind> = engine
            .run(&host(), "stat", |_conn| async { Err(RemoteCode::NO_ROWS_FOUND) })
            .await;
        assert_eq!(result, Err(ErrorKind::NotFound));

        let result: Result<Vec<String>, ErrorKind> = engine
            .run_listing(&host(), "list", |_conn| async { Err(RemoteCode::NO_ROWS_FOUND) })
            .await;
        assert_eq!(result, Ok(Vec::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_error_on_acquire_is_final() {
        let backend = MemoryBackend::new();
        backend.fail_always(Op::Environment, RemoteCode::from_errno(libc::ENOENT));
        let engine = engine_for(&backend);
        let start = Instant::now();

        let result: Result<(), ErrorKind> =
            engine.run(&host(), "stat", |_conn| async { Ok(()) }).await;
        assert_eq!(result, Err(ErrorKind::ConfigError));
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_host_times_out() {
        let backend = MemoryBackend::new();
        backend.fail_always(Op::Connect, RemoteCode::from_errno(libc::ECONNREFUSED));
        let engine = engine_for(&backend);

        let result: Result<(), ErrorKind> =
            engine.run(&host(), "stat", |_conn| async { Ok(()) }).await;
        assert_eq!(result, Err(ErrorKind::Timeout));
        assert_eq!(backend.count(Op::Connect), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_classification() {
        let backend = MemoryBackend::new();
        let engine = engine_for(&backend);

        // Semantic reopen failures surface
        let host = host();
        let mut retry = engine.begin(&host, "read");
        let conn = retry.connection().await.unwrap();
        let outcome: Result<Option<()>, ErrorKind> = retry
            .settle(&conn, Err(AttemptError::Resync(RemoteCode::from_errno(libc::ENOENT))))
            .await;
        assert_eq!(outcome, Err(ErrorKind::NotFound));

        // Anything else drops the connection and retries
        let outcome: Result<Option<()>, ErrorKind> = retry
            .settle(&conn, Err(AttemptError::Resync(RemoteCode::from_errno(libc::EIO))))
            .await;
        assert_eq!(outcome, Ok(None));
        assert!(!engine.cache().is_cached(&host).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let engine = engine_for(&MemoryBackend::new());
        let token = engine.cancel_token().child_token();
        let scoped = engine.with_cancellation(token.clone());

        let canceller = tokio::spawn({
            let token = token.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                token.cancel();
            }
        });

        let start = Instant::now();
        let result: Result<(), ErrorKind> =
            scoped.run(&host(), "stat", |_conn| async { Err(again()) }).await;
        assert_eq!(result, Err(ErrorKind::Cancelled));
        assert!(Instant::now() - start < Duration::from_secs(16));
        canceller.await.unwrap();

        // The parent engine is unaffected
        assert!(!engine.cancel_token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_attempt_invalidates() {
        let backend = MemoryBackend::new();
        let engine = engine_for(&backend);
        let token = engine.cancel_token().clone();

        let result: Result<(), ErrorKind> = engine
            .run(&host(), "read", |_conn| {
                let token = token.clone();
                async move {
                    token.cancel();
                    std::future::pending::<()>().await;
                    Ok(())
                }
            })
            .await;

        assert_eq!(result, Err(ErrorKind::Cancelled));
        assert!(!engine.cache().is_cached(&host()).await);
    }
}
