//! Pool-side collaborator shared by every client connection.
//!
//! [`RpcClientBase`] owns the lifecycle epoch, the subscription registry and
//! the head-observation bookkeeping. A client derives each query context
//! from it and registers every subscription under the epoch token current at
//! subscribe time; [`RpcClientBase::close`] advances the epoch, cancels
//! in-flight work from the old epoch and tears its subscriptions down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::ClientError;
use crate::subscription::{err_channel, ErrSender, ErrSignal, ManagedSubscription, Subscription};
use crate::types::Head;

/// Snapshot of what has been observed about the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainInfo {
    pub block_number: i64,
    pub finalized_block_number: i64,
    pub total_difficulty: Option<U256>,
}

/// Where polling subscriptions get their heads from.
#[async_trait]
pub trait HeadSource: Send + Sync + 'static {
    async fn latest_block(&self, ctx: &RequestContext) -> Result<Head, ClientError>;

    async fn latest_finalized_block(&self, ctx: &RequestContext) -> Result<Head, ClientError>;
}

/// Polling configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseConfig {
    pub new_heads_poll_interval: Duration,
    pub finalized_block_poll_interval: Duration,
}

struct State {
    lifecycle: CancellationToken,
    subs: HashMap<u64, Arc<Registered>>,
    latest: ChainInfo,
    highest_user_observations: ChainInfo,
}

struct Shared {
    cfg: BaseConfig,
    state: Mutex<State>,
    next_sub_id: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a panic elsewhere; the state is plain data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Lifecycle epochs, subscription registry and chain-info bookkeeping.
#[derive(Clone)]
pub struct RpcClientBase {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RpcClientBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClientBase")
            .field("cfg", &self.shared.cfg)
            .finish_non_exhaustive()
    }
}

impl RpcClientBase {
    pub fn new(cfg: BaseConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                state: Mutex::new(State {
                    lifecycle: CancellationToken::new(),
                    subs: HashMap::new(),
                    latest: ChainInfo::default(),
                    highest_user_observations: ChainInfo::default(),
                }),
                next_sub_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> BaseConfig {
        self.shared.cfg
    }

    /// Derive a query context bounded by `timeout` and the current epoch.
    ///
    /// Returns the context together with the epoch token it was tied to.
    pub fn acquire_query_ctx(
        &self,
        parent: &RequestContext,
        timeout: Duration,
    ) -> (RequestContext, CancellationToken) {
        let lifecycle = self.shared.lock().lifecycle.clone();
        let ctx = parent
            .with_timeout(timeout)
            .with_cancellation(lifecycle.clone());
        (ctx, lifecycle)
    }

    /// Register `sub` under the epoch `lifecycle`.
    ///
    /// If that epoch already ended the subscription is torn down and an error
    /// is returned.
    pub fn register_sub(
        &self,
        sub: Box<dyn Subscription<Error = ClientError>>,
        lifecycle: &CancellationToken,
    ) -> Result<ManagedSubscription, ClientError> {
        let id = self.shared.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let registered = Arc::new(Registered {
            id,
            inner: sub,
            base: Arc::downgrade(&self.shared),
        });

        let mut state = self.shared.lock();
        if lifecycle.is_cancelled() {
            drop(state);
            registered.inner.unsubscribe();
            return Err(ClientError::StaleLifecycle);
        }
        state.subs.insert(id, registered.clone());
        let managed: ManagedSubscription = registered;
        Ok(managed)
    }

    /// Number of live registered subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subs.len()
    }

    /// Unsubscribe everything except the given subscriptions.
    pub fn unsubscribe_all_except(&self, keep: &[ManagedSubscription]) {
        let dropped: Vec<Arc<Registered>> = {
            let mut state = self.shared.lock();
            let ids: Vec<u64> = state
                .subs
                .iter()
                .filter(|(_, sub)| !keep.iter().any(|k| same_sub(k, sub)))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.subs.remove(&id))
                .collect()
        };
        for sub in dropped {
            sub.inner.unsubscribe();
        }
    }

    /// Record a new head observed under `lifecycle`.
    ///
    /// The user-observation watermark moves even for stale epochs; the
    /// `latest` snapshot only moves for the current one. Health-check
    /// requests never touch the watermark.
    pub fn on_new_head(&self, ctx: &RequestContext, lifecycle: &CancellationToken, head: &Head) {
        let mut state = self.shared.lock();
        if !ctx.is_health_check() {
            let highest = &mut state.highest_user_observations;
            highest.block_number = highest.block_number.max(head.number);
            highest.total_difficulty = max_td(highest.total_difficulty, head.total_difficulty);
        }
        if lifecycle.is_cancelled() {
            return;
        }
        state.latest.block_number = head.number;
        state.latest.total_difficulty = head.total_difficulty;
    }

    /// Record a new finalized head observed under `lifecycle`.
    pub fn on_new_finalized_head(
        &self,
        ctx: &RequestContext,
        lifecycle: &CancellationToken,
        head: &Head,
    ) {
        let mut state = self.shared.lock();
        if !ctx.is_health_check() {
            let highest = &mut state.highest_user_observations;
            highest.finalized_block_number = highest.finalized_block_number.max(head.number);
        }
        if lifecycle.is_cancelled() {
            return;
        }
        state.latest.finalized_block_number = head.number;
    }

    /// `(latest, highest_user_observations)`.
    pub fn latest_chain_info(&self) -> (ChainInfo, ChainInfo) {
        let state = self.shared.lock();
        (state.latest.clone(), state.highest_user_observations.clone())
    }

    /// Advance the lifecycle epoch.
    ///
    /// Cancels every context derived from the previous epoch, unsubscribes
    /// every subscription registered under it and resets the `latest`
    /// snapshot. The user-observation watermark survives.
    pub fn close(&self) {
        let dropped: Vec<Arc<Registered>> = {
            let mut state = self.shared.lock();
            let old = std::mem::replace(&mut state.lifecycle, CancellationToken::new());
            old.cancel();
            state.latest = ChainInfo::default();
            state.subs.drain().map(|(_, sub)| sub).collect()
        };
        debug!(count = dropped.len(), "lifecycle epoch advanced, dropping subscriptions");
        for sub in dropped {
            sub.inner.unsubscribe();
        }
    }

    /// Deliver new heads by polling `source`.
    pub fn subscribe_to_heads(
        &self,
        ctx: &RequestContext,
        source: Arc<dyn HeadSource>,
    ) -> Result<(mpsc::Receiver<Head>, ManagedSubscription), ClientError> {
        let interval = self.shared.cfg.new_heads_poll_interval;
        if interval.is_zero() {
            return Err(ClientError::InvalidArgument("new heads poll interval is 0".into()));
        }
        self.start_poller(ctx, interval, PollTarget::Latest, source)
    }

    /// Deliver finalized heads by polling `source`.
    pub fn subscribe_to_finalized_heads(
        &self,
        ctx: &RequestContext,
        source: Arc<dyn HeadSource>,
    ) -> Result<(mpsc::Receiver<Head>, ManagedSubscription), ClientError> {
        let interval = self.shared.cfg.finalized_block_poll_interval;
        if interval.is_zero() {
            return Err(ClientError::InvalidArgument(
                "finalized block poll interval is 0".into(),
            ));
        }
        self.start_poller(ctx, interval, PollTarget::Finalized, source)
    }

    fn start_poller(
        &self,
        ctx: &RequestContext,
        interval: Duration,
        target: PollTarget,
        source: Arc<dyn HeadSource>,
    ) -> Result<(mpsc::Receiver<Head>, ManagedSubscription), ClientError> {
        let lifecycle = self.shared.lock().lifecycle.clone();
        let (tx, rx) = mpsc::channel(1);
        let (err_tx, err_rx) = err_channel();
        let stop = CancellationToken::new();

        tokio::spawn(poll_loop(
            ctx.detached(),
            interval,
            target,
            source,
            tx,
            stop.clone(),
            lifecycle.clone(),
        ));

        let poller = HeadPoller {
            stop,
            err_tx: Mutex::new(Some(err_tx)),
            err_rx,
        };
        let sub = self.register_sub(Box::new(poller), &lifecycle)?;
        Ok((rx, sub))
    }
}

#[derive(Debug, Clone, Copy)]
enum PollTarget {
    Latest,
    Finalized,
}

async fn poll_loop(
    ctx: RequestContext,
    interval: Duration,
    target: PollTarget,
    source: Arc<dyn HeadSource>,
    tx: mpsc::Sender<Head>,
    stop: CancellationToken,
    lifecycle: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = lifecycle.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let req_ctx = ctx.with_timeout(interval).with_cancellation(stop.clone());
        let res = match target {
            PollTarget::Latest => source.latest_block(&req_ctx).await,
            PollTarget::Finalized => source.latest_finalized_block(&req_ctx).await,
        };
        let head = match res {
            Ok(head) => head,
            Err(err) => {
                warn!(?target, error = %err, "head poll failed");
                continue;
            }
        };

        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            sent = tx.send(head) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

struct HeadPoller {
    stop: CancellationToken,
    err_tx: Mutex<Option<ErrSender<ClientError>>>,
    err_rx: ErrSignal<ClientError>,
}

impl Subscription for HeadPoller {
    type Error = ClientError;

    fn unsubscribe(&self) {
        self.stop.cancel();
        self.err_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn err(&self) -> ErrSignal<ClientError> {
        self.err_rx.clone()
    }
}

/// A subscription tracked by the registry.
struct Registered {
    id: u64,
    inner: Box<dyn Subscription<Error = ClientError>>,
    base: Weak<Shared>,
}

impl Subscription for Registered {
    type Error = ClientError;

    fn unsubscribe(&self) {
        if let Some(shared) = self.base.upgrade() {
            shared.lock().subs.remove(&self.id);
        }
        self.inner.unsubscribe();
    }

    fn err(&self) -> ErrSignal<ClientError> {
        self.inner.err()
    }
}

fn same_sub(a: &ManagedSubscription, b: &Arc<Registered>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn max_td(a: Option<U256>, b: Option<U256>) -> Option<U256> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
