//! Per-request context: cancellation, deadline and the response-size limit.
//!
//! A [`RequestContext`] is threaded explicitly through every transport call.
//! It is cheap to clone and every `with_*` builder returns a derived copy, so
//! a parent context is never mutated by the callee.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// Cancellation scope, deadline and request-scoped knobs for one call.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    tokens: Vec<CancellationToken>,
    deadline: Option<Instant>,
    response_size_limit: u32,
    health_check: bool,
}

impl RequestContext {
    /// A context with no cancellation, no deadline and no limits.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context that also ends when `token` is cancelled.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        let mut ctx = self.clone();
        ctx.tokens.push(token);
        ctx
    }

    /// Derive a context whose deadline is at most `timeout` from now.
    ///
    /// An earlier deadline inherited from the parent is kept.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context with the earlier of the current and the given deadline.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut ctx = self.clone();
        ctx.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        ctx
    }

    /// Attach a response-size limit in bytes.
    ///
    /// A zero limit means "unlimited" and returns the context unchanged.
    pub fn with_response_size_limit(&self, limit: u32) -> Self {
        if limit == 0 {
            return self.clone();
        }
        let mut ctx = self.clone();
        ctx.response_size_limit = limit;
        ctx
    }

    /// Mark the context as belonging to a health check.
    ///
    /// Head observations made under such a context do not move the
    /// highest-user-observation watermark.
    pub fn with_health_check(&self) -> Self {
        let mut ctx = self.clone();
        ctx.health_check = true;
        ctx
    }

    /// A background context that keeps only the health-check flag.
    ///
    /// Used by background work that outlives the call which started it.
    pub fn detached(&self) -> Self {
        Self {
            health_check: self.health_check,
            ..Self::default()
        }
    }

    /// The byte limit for response bodies, or `None` when unlimited.
    pub fn response_size_limit(&self) -> Option<u32> {
        (self.response_size_limit > 0).then_some(self.response_size_limit)
    }

    pub fn is_health_check(&self) -> bool {
        self.health_check
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.tokens.iter().any(CancellationToken::is_cancelled)
    }

    /// The reason this context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<TransportError> {
        if self.is_cancelled() {
            return Some(TransportError::Cancelled);
        }
        match self.deadline {
            Some(d) if d <= Instant::now() => Some(TransportError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once any token is cancelled or the deadline passes.
    pub async fn done(&self) -> TransportError {
        let cancelled = async {
            if self.tokens.is_empty() {
                std::future::pending::<()>().await;
            } else {
                let waits = self.tokens.iter().map(|t| Box::pin(t.cancelled()));
                futures::future::select_all(waits).await;
            }
        };
        let expired = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => TransportError::Cancelled,
            _ = expired => TransportError::DeadlineExceeded,
        }
    }

    /// Drive `fut` to completion unless the context ends first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_leaves_context_unchanged() {
        let ctx = RequestContext::background().with_response_size_limit(0);
        assert_eq!(ctx.response_size_limit(), None);
        let ctx = ctx.with_response_size_limit(1024);
        assert_eq!(ctx.response_size_limit(), Some(1024));
        let ctx = ctx.with_response_size_limit(0);
        assert_eq!(ctx.response_size_limit(), Some(1024));
    }

    #[test]
    fn earlier_deadline_wins() {
        let short = RequestContext::background().with_timeout(Duration::from_millis(10));
        let derived = short.with_timeout(Duration::from_secs(60));
        assert_eq!(short.deadline(), derived.deadline());
    }

    #[test]
    fn detached_keeps_only_the_health_check_flag() {
        let token = CancellationToken::new();
        let parent = RequestContext::background()
            .with_cancellation(token.clone())
            .with_timeout(Duration::from_millis(10))
            .with_response_size_limit(64)
            .with_health_check();
        let detached = parent.detached();
        assert!(detached.is_health_check());
        assert_eq!(detached.deadline(), None);
        assert_eq!(detached.response_size_limit(), None);
        token.cancel();
        assert!(parent.is_cancelled());
        assert!(!detached.is_cancelled());

        assert!(!RequestContext::background().detached().is_health_check());
    }

    #[tokio::test]
    async fn run_returns_cancelled_when_any_token_fires() {
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let ctx = RequestContext::background()
            .with_cancellation(a.clone())
            .with_cancellation(b.clone());
        b.cancel();
        let res: Result<(), _> = ctx.run(std::future::pending()).await;
        assert!(matches!(res, Err(TransportError::Cancelled)));
        assert!(!a.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_deadline_exceeded() {
        let ctx = RequestContext::background().with_timeout(Duration::from_millis(50));
        let res: Result<(), _> = ctx.run(std::future::pending()).await;
        assert!(matches!(res, Err(TransportError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn run_passes_through_result() {
        let ctx = RequestContext::background().with_timeout(Duration::from_secs(5));
        let res = ctx.run(async { Ok::<_, TransportError>(7) }).await;
        assert_eq!(res.unwrap(), 7);
    }
}
