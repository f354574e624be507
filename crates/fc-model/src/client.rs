use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use fc_core::abort::AbortSignal;
use fc_core::config::ThrottleConfig;

use crate::limiter::RateGate;
use crate::provider::{
    ChatMessage, ChatOptions, ChatProvider, ChatStream, ModelError, Result, StreamEvent,
};

/// Per-attempt deadline, independent of backoff.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(120);

/// Base of the exponential backoff between retries.
pub const BACKOFF_BASE: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// RateLimitedClient
// ---------------------------------------------------------------------------

/// Wraps a provider with the full dispatch discipline:
///
/// - FIFO queue: a fair dispatch lock means the head of the queue is never
///   overtaken, even while it waits on rate limits.
/// - Concurrency cap via semaphore; the permit is held for the lifetime of
///   the returned stream.
/// - RPM and TPM token buckets must both admit a request before dispatch.
/// - Retries only on 429/502/503, backoff `base * 2^attempt`, Retry-After
///   honored, max attempts bounded by config.
/// - Cancellation: a queued request aborts without a network call; an
///   in-flight request stops streaming and releases its slot.
pub struct RateLimitedClient {
    provider: Arc<dyn ChatProvider>,
    dispatch: Mutex<()>,
    semaphore: Arc<Semaphore>,
    gate: Option<RateGate>,
    retry_attempts: u32,
    attempt_timeout: Duration,
    backoff_base: Duration,
}

impl RateLimitedClient {
    pub fn new(provider: Arc<dyn ChatProvider>, config: &ThrottleConfig) -> Self {
        Self {
            provider,
            dispatch: Mutex::new(()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            gate: config.enabled.then(|| {
                RateGate::new(config.requests_per_minute, config.tokens_per_minute)
            }),
            retry_attempts: config.retry_attempts.max(1),
            attempt_timeout: ATTEMPT_TIMEOUT,
            backoff_base: BACKOFF_BASE,
        }
    }

    /// Shrink timing constants (tests).
    pub fn with_timing(mut self, attempt_timeout: Duration, backoff_base: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self.backoff_base = backoff_base;
        self
    }

    /// Stream a chat completion under the dispatch discipline.
    ///
    /// `estimated_tokens` is the prompt-size estimate charged against the
    /// TPM bucket before dispatch.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
        estimated_tokens: u64,
        abort: AbortSignal,
    ) -> Result<ChatStream> {
        if abort.is_aborted() {
            return Err(ModelError::Cancelled);
        }

        // FIFO dispatch: the fair mutex is the queue. While the head waits
        // on rate limits it holds the lock, so no later request overtakes it.
        let permit = {
            let mut queue_abort = abort.clone();
            let guard = tokio::select! {
                guard = self.dispatch.lock() => guard,
                _ = queue_abort.aborted() => return Err(ModelError::Cancelled),
            };

            if let Some(ref gate) = self.gate {
                tokio::select! {
                    _ = gate.admit(estimated_tokens) => {}
                    _ = queue_abort.aborted() => return Err(ModelError::Cancelled),
                }
            }

            let permit = tokio::select! {
                permit = Arc::clone(&self.semaphore).acquire_owned() => {
                    permit.expect("semaphore closed")
                }
                _ = queue_abort.aborted() => {
                    if let Some(ref gate) = self.gate {
                        gate.refund(estimated_tokens);
                    }
                    return Err(ModelError::Cancelled);
                }
            };

            if abort.is_aborted() {
                if let Some(ref gate) = self.gate {
                    gate.refund(estimated_tokens);
                }
                return Err(ModelError::Cancelled);
            }

            drop(guard);
            permit
        };

        // Retry loop. Only establishment failures retry; once a stream is
        // handed out it is never silently re-requested.
        let mut last_status: u16 = 0;
        for attempt in 0..self.retry_attempts {
            if attempt > 0 {
                // Subsequent attempts are fresh requests against the quota.
                if let Some(ref gate) = self.gate {
                    gate.admit(estimated_tokens).await;
                }
            }

            let mut attempt_abort = abort.clone();
            let result = tokio::select! {
                result = tokio::time::timeout(
                    self.attempt_timeout,
                    self.provider.chat(messages, opts),
                ) => result.unwrap_or(Err(ModelError::Timeout)),
                _ = attempt_abort.aborted() => Err(ModelError::Cancelled),
            };

            match result {
                Ok(stream) => {
                    debug!(attempt, "model request dispatched");
                    return Ok(hold_permit(stream, permit, abort));
                }
                Err(ModelError::Cancelled) => return Err(ModelError::Cancelled),
                Err(err) => {
                    let backoff = match &err {
                        ModelError::RateLimited { retry_after_secs } => {
                            last_status = 429;
                            retry_after_secs
                                .map(Duration::from_secs)
                                .unwrap_or_else(|| self.backoff_base * 2u32.pow(attempt))
                        }
                        ModelError::Api { status, .. } if *status == 502 || *status == 503 => {
                            last_status = *status;
                            self.backoff_base * 2u32.pow(attempt)
                        }
                        _ => return Err(err),
                    };

                    if attempt + 1 >= self.retry_attempts {
                        break;
                    }
                    warn!(attempt, last_status, backoff_ms = backoff.as_millis() as u64,
                        "model request failed, backing off");
                    let mut backoff_abort = abort.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = backoff_abort.aborted() => return Err(ModelError::Cancelled),
                    }
                }
            }
        }

        Err(ModelError::Exhausted {
            attempts: self.retry_attempts,
            last_status,
        })
    }
}

/// Forward the inner stream while holding the semaphore permit; an abort
/// mid-stream surfaces as `Cancelled` and releases the slot.
fn hold_permit(
    mut inner: ChatStream,
    permit: tokio::sync::OwnedSemaphorePermit,
    abort: AbortSignal,
) -> ChatStream {
    let (tx, rx) = flume::unbounded::<Result<StreamEvent>>();
    tokio::spawn(async move {
        let _permit = permit;
        let mut abort = abort;
        loop {
            tokio::select! {
                event = inner.next() => match event {
                    Some(item) => {
                        if tx.send(item).is_err() {
                            return;
                        }
                    }
                    None => return,
                },
                _ = abort.aborted() => {
                    let _ = tx.send(Err(ModelError::Cancelled));
                    return;
                }
            }
        }
    });
    Box::pin(rx.into_stream())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{collect_stream, MockChatProvider, Usage};
    use async_trait::async_trait;
    use fc_core::abort::AbortHandle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn throttle(max_concurrent: usize) -> ThrottleConfig {
        ThrottleConfig {
            max_concurrent_requests: max_concurrent,
            requests_per_minute: 10_000,
            tokens_per_minute: 10_000_000,
            retry_attempts: 3,
            enabled: true,
        }
    }

    fn fast(client: RateLimitedClient) -> RateLimitedClient {
        client.with_timing(Duration::from_secs(5), Duration::from_millis(10))
    }

    fn expect_err<T>(result: std::result::Result<T, ModelError>) -> ModelError {
        match result {
            Ok(_) => panic!("expected error, got Ok"),
            Err(e) => e,
        }
    }

    /// Provider that records call order and holds each call open briefly.
    struct SlowProvider {
        order: Arc<StdMutex<Vec<usize>>>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        delay: Duration,
        next_id: AtomicUsize,
    }

    impl SlowProvider {
        fn new(delay: Duration) -> Self {
            Self {
                order: Arc::new(StdMutex::new(Vec::new())),
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_in_flight: Arc::new(AtomicUsize::new(0)),
                delay,
                next_id: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatProvider for SlowProvider {
        async fn chat(
            &self,
            messages: &[ChatMessage],
            _opts: &ChatOptions,
        ) -> Result<ChatStream> {
            let id = messages[0]
                .content
                .parse::<usize>()
                .unwrap_or_else(|_| self.next_id.fetch_add(1, Ordering::SeqCst));
            self.order.lock().unwrap().push(id);

            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let (tx, rx) = flume::unbounded::<Result<StreamEvent>>();
            let _ = tx.send(Ok(StreamEvent::Done(Usage::default())));
            Ok(Box::pin(rx.into_stream()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_429_then_succeeds_with_three_attempts() {
        let mock = MockChatProvider::new()
            .with_status(429, Some(1))
            .with_status(429, Some(1))
            .with_reply("recovered");
        let client = fast(RateLimitedClient::new(Arc::new(mock.clone()), &throttle(2)));

        let start = tokio::time::Instant::now();
        let stream = client
            .chat(
                &[ChatMessage::user("q")],
                &ChatOptions::default(),
                100,
                AbortSignal::never(),
            )
            .await
            .unwrap();
        let (text, _) = collect_stream(stream).await.unwrap();

        assert_eq!(text, "recovered");
        assert_eq!(mock.call_count(), 3);
        // Two Retry-After: 1 waits were honored.
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_after_max_attempts_carries_last_status() {
        let mock = MockChatProvider::new()
            .with_status(503, None)
            .with_status(503, None)
            .with_status(503, None);
        let client = fast(RateLimitedClient::new(Arc::new(mock.clone()), &throttle(2)));

        let err = expect_err(
            client
                .chat(
                    &[ChatMessage::user("q")],
                    &ChatOptions::default(),
                    10,
                    AbortSignal::never(),
                )
                .await,
        );

        match err {
            ModelError::Exhausted {
                attempts,
                last_status,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_status, 503);
            }
            other => panic!("unexpected: {other}"),
        }
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn non_retryable_status_fails_on_first_attempt() {
        let mock = MockChatProvider::new().with_status(400, None);
        let client = fast(RateLimitedClient::new(Arc::new(mock.clone()), &throttle(2)));

        let err = expect_err(
            client
                .chat(
                    &[ChatMessage::user("q")],
                    &ChatOptions::default(),
                    10,
                    AbortSignal::never(),
                )
                .await,
        );
        assert!(matches!(err, ModelError::Api { status: 400, .. }));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_cap() {
        let provider = Arc::new(SlowProvider::new(Duration::from_millis(30)));
        let client = Arc::new(fast(RateLimitedClient::new(
            Arc::clone(&provider) as Arc<dyn ChatProvider>,
            &throttle(2),
        )));

        let mut handles = Vec::new();
        for i in 0..5 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                let stream = client
                    .chat(
                        &[ChatMessage::user(i.to_string())],
                        &ChatOptions::default(),
                        1,
                        AbortSignal::never(),
                    )
                    .await
                    .unwrap();
                collect_stream(stream).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(provider.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn dispatch_order_is_fifo() {
        let provider = Arc::new(SlowProvider::new(Duration::from_millis(10)));
        let client = Arc::new(fast(RateLimitedClient::new(
            Arc::clone(&provider) as Arc<dyn ChatProvider>,
            &throttle(1),
        )));

        let mut handles = Vec::new();
        for i in 0..4 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                let stream = client
                    .chat(
                        &[ChatMessage::user(i.to_string())],
                        &ChatOptions::default(),
                        1,
                        AbortSignal::never(),
                    )
                    .await
                    .unwrap();
                collect_stream(stream).await.unwrap();
            }));
            // Stagger submissions so queue order is deterministic.
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*provider.order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn queued_request_aborts_without_network_call() {
        let provider = Arc::new(SlowProvider::new(Duration::from_millis(100)));
        let client = Arc::new(fast(RateLimitedClient::new(
            Arc::clone(&provider) as Arc<dyn ChatProvider>,
            &throttle(1),
        )));

        // Fill the single slot.
        let first = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let stream = client
                    .chat(
                        &[ChatMessage::user("0".to_string())],
                        &ChatOptions::default(),
                        1,
                        AbortSignal::never(),
                    )
                    .await
                    .unwrap();
                collect_stream(stream).await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Queue a second request, then abort it before a slot frees.
        let (handle, signal) = AbortHandle::new();
        let queued = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .chat(
                        &[ChatMessage::user("1".to_string())],
                        &ChatOptions::default(),
                        1,
                        signal,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.abort();

        let result = queued.await.unwrap();
        assert!(matches!(result, Err(ModelError::Cancelled)));
        first.await.unwrap();
        // Only the first request ever reached the provider.
        assert_eq!(provider.order.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pre_aborted_request_never_dispatches() {
        let mock = MockChatProvider::new();
        let client = fast(RateLimitedClient::new(Arc::new(mock.clone()), &throttle(1)));
        let (handle, signal) = AbortHandle::new();
        handle.abort();

        let err = expect_err(
            client
                .chat(&[ChatMessage::user("q")], &ChatOptions::default(), 1, signal)
                .await,
        );
        assert!(matches!(err, ModelError::Cancelled));
        assert_eq!(mock.call_count(), 0);
    }
}
