//! Reconnect policy for network sources.
//!
//! A [`Retrier`] wraps a [`NetworkSource`] and gives it automatic
//! reconnection: transient failures are retried after an arithmetic
//! backoff with jitter, fatal ones are returned immediately.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::source::{NetworkSource, Reader, Source, SourceId};

/// Produces the multiplier applied to each backoff step.
pub type JitterFn = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Exponentially distributed jitter with mean 1.
#[must_use]
pub fn exponential_jitter() -> f64 {
    let u: f64 = rand::random();
    -(1.0 - u).ln()
}

/// How a [`Retrier`] reconnects.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of connect attempts. `None` retries forever.
    pub tries: Option<u32>,
    /// Seconds added to the wait after every failed attempt.
    pub delay: f64,
    /// Ceiling for the wait, in seconds. May be `f64::INFINITY`.
    pub max_timeout: f64,
    /// Multiplier drawn for every step, so that many clients reconnecting
    /// at once spread out.
    pub jitter: JitterFn,
}

impl RetryPolicy {
    /// Cap the number of attempts.
    #[must_use]
    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = Some(tries);
        self
    }

    /// Set the backoff step in seconds.
    #[must_use]
    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    /// Set the backoff ceiling in seconds.
    #[must_use]
    pub fn with_max_timeout(mut self, max_timeout: f64) -> Self {
        self.max_timeout = max_timeout;
        self
    }

    /// Use a custom jitter function.
    #[must_use]
    pub fn with_jitter(mut self, jitter: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.jitter = Arc::new(jitter);
        self
    }

    /// Disable jitter (multiplier fixed at 1).
    #[must_use]
    pub fn without_jitter(self) -> Self {
        self.with_jitter(|| 1.0)
    }

    fn tries_label(&self) -> String {
        self.tries
            .map_or_else(|| "inf".to_string(), |tries| tries.to_string())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            tries: None,
            delay: 1.0,
            max_timeout: 60.0,
            jitter: Arc::new(exponential_jitter),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("tries", &self.tries)
            .field("delay", &self.delay)
            .field("max_timeout", &self.max_timeout)
            .finish_non_exhaustive()
    }
}

/// Wait generator for one sequence of attempts.
///
/// Each step adds `delay * jitter` to an accumulator. Once the accumulator
/// passes `max_timeout` the step yields `max_timeout + jitter` instead.
pub struct Backoff {
    delay: f64,
    max_timeout: f64,
    jitter: JitterFn,
    accumulated: f64,
}

impl Backoff {
    /// Start a fresh sequence.
    #[must_use]
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            delay: policy.delay,
            max_timeout: policy.max_timeout,
            jitter: Arc::clone(&policy.jitter),
            accumulated: 0.0,
        }
    }

    /// Next wait, in seconds.
    pub fn next_secs(&mut self) -> f64 {
        let jitter = (self.jitter)();
        self.accumulated += self.delay * jitter;
        if self.accumulated > self.max_timeout {
            return self.max_timeout + jitter;
        }
        self.accumulated
    }

    /// Next wait.
    pub fn next_delay(&mut self) -> Duration {
        secs_to_duration(self.next_secs())
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// A network source with automatic reconnection.
///
/// The retrier is itself a source: its `consume` runs the session loop of
/// [`Retrier::start`], so a wrapped source can be handed straight to a
/// transmitter.
pub struct Retrier {
    source: Arc<dyn NetworkSource>,
    policy: RetryPolicy,
}

impl Retrier {
    /// Wrap a source.
    #[must_use]
    pub fn new<S: NetworkSource + 'static>(source: S, policy: RetryPolicy) -> Self {
        Self::from_arc(Arc::new(source), policy)
    }

    /// Wrap a shared source.
    #[must_use]
    pub fn from_arc(source: Arc<dyn NetworkSource>, policy: RetryPolicy) -> Self {
        Self { source, policy }
    }

    /// The configured policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The wrapped source.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn NetworkSource> {
        &self.source
    }

    /// Run a session: consume, and on failure reconnect and consume again.
    ///
    /// Returns `Ok(())` once a consume ends cleanly or `cancel` fires, and
    /// an error only when reconnecting gives up.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), SourceError> {
        let url = self.source.url();
        let mut backoff = Backoff::new(&self.policy);
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let result = self.source.consume(cancel.clone()).await;
            if cancel.is_cancelled() {
                return Ok(());
            }
            let Err(err) = result else {
                return Ok(());
            };
            debug!(url, error = %err, "Consume failed, reconnecting");
            NetworkSource::connect(self, cancel.clone()).await?;
            if !pause(&cancel, backoff.next_delay()).await {
                return Ok(());
            }
        }
    }
}

impl fmt::Debug for Retrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrier")
            .field("url", &self.source.url())
            .field("policy", &self.policy)
            .finish()
    }
}

#[async_trait]
impl Source for Retrier {
    fn id(&self) -> SourceId {
        self.source.id()
    }

    async fn consume(&self, cancel: CancellationToken) -> Result<(), SourceError> {
        self.start(cancel).await
    }

    fn reader(&self) -> Reader {
        self.source.reader()
    }

    async fn write(&self, payload: Bytes) -> Result<(), SourceError> {
        self.source.write(payload).await
    }
}

#[async_trait]
impl NetworkSource for Retrier {
    async fn connect(&self, cancel: CancellationToken) -> Result<(), SourceError> {
        let url = self.source.url();
        let max = self.policy.tries_label();
        let mut backoff = Backoff::new(&self.policy);
        let mut attempts: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            debug!(url, "Connecting, attempt {}/{}", attempts + 1, max);
            let result = self.source.connect(cancel.clone()).await;
            if cancel.is_cancelled() {
                return Ok(());
            }
            let Err(err) = result else {
                return Ok(());
            };
            if err.is_fatal() {
                debug!(url, error = %err, "Connect error is fatal");
                return Err(err);
            }
            attempts += 1;
            warn!(url, error = %err, "Connect failed");
            if !pause(&cancel, backoff.next_delay()).await {
                return Ok(());
            }
            if let Some(tries) = self.policy.tries {
                if attempts >= tries {
                    return Err(SourceError::AttemptsExceeded { attempts });
                }
            }
        }
    }

    fn url(&self) -> &str {
        self.source.url()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Inbox;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Network source whose connect and consume outcomes are scripted.
    struct Flaky {
        id: SourceId,
        inbox: Inbox,
        fatal: bool,
        connect_failures: Mutex<u32>,
        consume_failures: Mutex<u32>,
        connects: AtomicU32,
        consumes: AtomicU32,
    }

    impl Flaky {
        fn new(connect_failures: u32, consume_failures: u32) -> Self {
            Self {
                id: SourceId::next(),
                inbox: Inbox::new(),
                fatal: false,
                connect_failures: Mutex::new(connect_failures),
                consume_failures: Mutex::new(consume_failures),
                connects: AtomicU32::new(0),
                consumes: AtomicU32::new(0),
            }
        }

        fn fatal() -> Self {
            Self {
                fatal: true,
                ..Self::new(0, 0)
            }
        }

        fn take(counter: &Mutex<u32>) -> bool {
            let mut left = counter.lock().unwrap();
            if *left == 0 {
                return false;
            }
            *left -= 1;
            true
        }
    }

    #[async_trait]
    impl Source for Flaky {
        fn id(&self) -> SourceId {
            self.id
        }

        async fn consume(&self, _cancel: CancellationToken) -> Result<(), SourceError> {
            self.consumes.fetch_add(1, Ordering::SeqCst);
            if Self::take(&self.consume_failures) {
                return Err(SourceError::Read("connection reset".into()));
            }
            Ok(())
        }

        fn reader(&self) -> Reader {
            self.inbox.reader()
        }

        async fn write(&self, _payload: Bytes) -> Result<(), SourceError> {
            Ok(())
        }
    }

    #[async_trait]
    impl NetworkSource for Flaky {
        async fn connect(&self, _cancel: CancellationToken) -> Result<(), SourceError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                return Err(SourceError::fatal("unauthorized"));
            }
            if Self::take(&self.connect_failures) {
                return Err(SourceError::Connect("connection refused".into()));
            }
            Ok(())
        }

        fn url(&self) -> &str {
            "tcp://flaky:1"
        }
    }

    fn unit_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_delay(1.0)
            .with_max_timeout(60.0)
            .without_jitter()
    }

    #[test]
    fn test_backoff_arithmetic_progression() {
        let policy = RetryPolicy::default()
            .with_delay(2.0)
            .with_max_timeout(7.0)
            .without_jitter();
        let mut backoff = Backoff::new(&policy);

        let waits: Vec<f64> = (0..6).map(|_| backoff.next_secs()).collect();
        // 2, 4, 6 follow the progression; past the ceiling it stays at max + jitter
        assert_eq!(waits, vec![2.0, 4.0, 6.0, 8.0, 8.0, 8.0]);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = unit_policy().with_max_timeout(5.0);
        let mut backoff = Backoff::new(&policy);

        let mut previous = 0.0;
        for n in 1..=20 {
            let wait = backoff.next_secs();
            if n <= 5 {
                assert_eq!(wait, f64::from(n));
                assert!(wait >= previous);
            }
            assert!(wait <= 5.0 + 1.0);
            previous = wait;
        }
    }

    #[test]
    fn test_backoff_unbounded_ceiling() {
        let policy = unit_policy().with_max_timeout(f64::INFINITY);
        let mut backoff = Backoff::new(&policy);
        for _ in 0..99 {
            backoff.next_secs();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(100));
    }

    #[test]
    fn test_backoff_fresh_sequence_resets() {
        let policy = unit_policy();
        let mut first = Backoff::new(&policy);
        first.next_secs();
        first.next_secs();

        let mut second = Backoff::new(&policy);
        assert_eq!(second.next_secs(), 1.0);
    }

    #[test]
    fn test_negative_wait_saturates_to_zero() {
        assert_eq!(secs_to_duration(-3.0), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::NAN), Duration::ZERO);
        assert_eq!(secs_to_duration(1.5), Duration::from_millis(1500));
    }

    #[test]
    fn test_exponential_jitter_is_non_negative() {
        for _ in 0..1000 {
            let j = exponential_jitter();
            assert!(j >= 0.0 && j.is_finite());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_short_circuits() {
        let flaky = Arc::new(Flaky::fatal());
        let retrier = Retrier::from_arc(flaky.clone(), unit_policy().with_tries(5));

        let started = Instant::now();
        let err = NetworkSource::connect(&retrier, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(flaky.connects.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_exceeded_after_cap() {
        let flaky = Arc::new(Flaky::new(u32::MAX, 0));
        let retrier = Retrier::from_arc(flaky.clone(), unit_policy().with_tries(3));

        let started = Instant::now();
        let err = NetworkSource::connect(&retrier, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SourceError::AttemptsExceeded { attempts: 3 }));
        assert_eq!(flaky.connects.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6));
        assert!(elapsed < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_recovers_from_transient_failures() {
        let flaky = Arc::new(Flaky::new(2, 0));
        let retrier = Retrier::from_arc(flaky.clone(), unit_policy().with_tries(5));

        let started = Instant::now();
        NetworkSource::connect(&retrier, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(flaky.connects.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_unlimited_retries() {
        let flaky = Arc::new(Flaky::new(u32::MAX, 0));
        let retrier = Retrier::from_arc(flaky.clone(), unit_policy());
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                cancel.cancel();
            })
        };

        NetworkSource::connect(&retrier, cancel).await.unwrap();
        canceller.await.unwrap();
        assert!(flaky.connects.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_reconnects_after_consume_failure() {
        let flaky = Arc::new(Flaky::new(0, 2));
        let retrier = Retrier::from_arc(flaky.clone(), unit_policy());

        retrier.start(CancellationToken::new()).await.unwrap();

        assert_eq!(flaky.consumes.load(Ordering::SeqCst), 3);
        assert_eq!(flaky.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_gives_up_on_fatal_reconnect() {
        let flaky = Arc::new(Flaky {
            consume_failures: Mutex::new(1),
            ..Flaky::fatal()
        });
        let retrier = Retrier::from_arc(flaky.clone(), unit_policy());

        let err = Source::consume(&retrier, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(flaky.consumes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_returns_immediately_when_cancelled() {
        let flaky = Arc::new(Flaky::new(0, 0));
        let retrier = Retrier::from_arc(flaky.clone(), unit_policy());
        let cancel = CancellationToken::new();
        cancel.cancel();

        retrier.start(cancel).await.unwrap();
        assert_eq!(flaky.consumes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_retrier_keeps_source_identity() {
        let flaky = Arc::new(Flaky::new(0, 0));
        let id = flaky.id;
        let retrier = Retrier::from_arc(flaky, RetryPolicy::default());
        assert_eq!(Source::id(&retrier), id);
        assert_eq!(NetworkSource::url(&retrier), "tcp://flaky:1");
    }
}
