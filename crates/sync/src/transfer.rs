//! Transfer sessions over the wire-level DAG exchange.
//!
//! [`Transfer`] wraps a [`GraphExchange`] (the protocol that actually moves
//! blocks) with the bookkeeping the engine needs: an in-progress registry
//! keyed by `(link, peer)` whose waiters are signalled exactly once, the
//! classification of terminal events, and the shared [`BlockIngest`]
//! pipeline every transport feeds incoming blocks through.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use libp2p_identity::PeerId;
use tendril_primitives::Cid;
use tendril_store::LinkStore;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::gate::{GateDecision, PeerLimiter, RateGate, RATE_LIMIT_SENTINEL};
use crate::selector::Selector;

/// One wire request: fetch the subgraph of `root` from `peer` under
/// `selector`.
#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub peer: PeerId,
    pub root: Cid,
    pub selector: Selector,
}

/// Terminal events surfaced by the wire protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferEvent {
    Completed,
    Cancelled,
    Failed(String),
}

/// A block the ingest pipeline refused; the transport must terminate the
/// current transfer with this message.
#[derive(Debug)]
pub struct BlockRejected {
    rate_limited: bool,
    message: String,
}

impl BlockRejected {
    pub(crate) fn rate_limited() -> Self {
        Self {
            rate_limited: true,
            message: RATE_LIMIT_SENTINEL.to_owned(),
        }
    }

    fn store(cid: &Cid, err: impl fmt::Display) -> Self {
        Self {
            rate_limited: false,
            message: format!("storing block {cid}: {err}"),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        self.rate_limited
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for BlockRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Caller-supplied hook invoked once per block the transfer brings in.
pub type BlockHook = Arc<dyn Fn(PeerId, Cid) + Send + Sync>;

/// Receives every incoming block of a transfer.
#[async_trait]
pub trait BlockSink: Send + Sync {
    /// Delivers one block. `size_on_wire` is zero when the transport
    /// already had the block locally. An error terminates the transfer.
    async fn deliver(
        &self,
        peer: PeerId,
        cid: Cid,
        bytes: &[u8],
        size_on_wire: usize,
    ) -> Result<(), BlockRejected>;
}

/// Wire-level DAG exchange, opaque to the engine beyond this seam.
#[async_trait]
pub trait GraphExchange: Send + Sync {
    /// Drives one transfer to a terminal event, delivering each incoming
    /// block to `blocks` and watching `token` for cancellation.
    async fn execute(
        &self,
        request: TransferRequest,
        blocks: Arc<dyn BlockSink>,
        token: CancellationToken,
    ) -> TransferEvent;

    /// Queries the publisher's advertised head. `None` means the publisher
    /// has not announced a root yet.
    async fn head(&self, peer: PeerId) -> Result<Option<Cid>, SyncError>;
}

/// A per-peer view of a transport, as consumed by the sync handler.
#[async_trait]
pub trait Syncer: Send + Sync {
    async fn get_head(&self, token: &CancellationToken) -> Result<Option<Cid>, SyncError>;

    async fn sync(
        &self,
        token: &CancellationToken,
        root: Cid,
        selector: Selector,
    ) -> Result<(), SyncError>;
}

/// Hands out [`Syncer`]s for individual peers.
#[async_trait]
pub trait Transport: Send + Sync {
    fn syncer(self: Arc<Self>, peer: PeerId, limiter: Option<Arc<PeerLimiter>>) -> Arc<dyn Syncer>;

    async fn close(&self) -> eyre::Result<()>;
}

/// Gate, verify-and-store, then hook; the one path every incoming block
/// takes regardless of transport.
pub struct BlockIngest {
    store: Arc<dyn LinkStore>,
    gate: Arc<RateGate>,
    hook: Option<BlockHook>,
}

impl BlockIngest {
    pub fn new(store: Arc<dyn LinkStore>, gate: Arc<RateGate>, hook: Option<BlockHook>) -> Self {
        Self { store, gate, hook }
    }

    pub fn gate(&self) -> &Arc<RateGate> {
        &self.gate
    }

    pub fn store(&self) -> &Arc<dyn LinkStore> {
        &self.store
    }
}

#[async_trait]
impl BlockSink for BlockIngest {
    async fn deliver(
        &self,
        peer: PeerId,
        cid: Cid,
        bytes: &[u8],
        size_on_wire: usize,
    ) -> Result<(), BlockRejected> {
        let invoke_hook = match self.gate.admit(peer, cid, size_on_wire) {
            GateDecision::RateLimited => return Err(BlockRejected::rate_limited()),
            GateDecision::Pass { invoke_hook } => invoke_hook,
        };

        if size_on_wire > 0 {
            self.store
                .put(&cid, bytes)
                .await
                .map_err(|err| BlockRejected::store(&cid, err))?;
        }

        if invoke_hook {
            if let Some(hook) = &self.hook {
                hook(peer, cid);
            }
        }

        Ok(())
    }
}

type SyncKey = (Cid, PeerId);
type DoneSender = oneshot::Sender<Result<(), SyncError>>;

/// Shared transfer state for one wire exchange.
pub struct Transfer {
    exchange: Arc<dyn GraphExchange>,
    ingest: Arc<BlockIngest>,
    pending: Mutex<HashMap<SyncKey, DoneSender>>,
    closed: AtomicBool,
}

impl Transfer {
    pub fn new(exchange: Arc<dyn GraphExchange>, ingest: Arc<BlockIngest>) -> Arc<Self> {
        Arc::new(Self {
            exchange,
            ingest,
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Registers an in-progress entry and returns its completion waiter.
    fn notify_on_done(&self, key: SyncKey) -> Result<oneshot::Receiver<Result<(), SyncError>>, SyncError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }

        let (tx, rx) = oneshot::channel();

        let mut pending = self.pending.lock().expect("lock poisoned");
        if pending.insert(key, tx).is_some() {
            warn!(cid = %key.0, peer = %key.1, "replaced an in-progress sync entry");
        }

        Ok(rx)
    }

    /// Removes and signals the waiter for `key`. Returns false when no
    /// entry was registered (already drained by cancellation or close).
    fn signal_done(&self, key: &SyncKey, result: Result<(), SyncError>) -> bool {
        let sender = {
            let mut pending = self.pending.lock().expect("lock poisoned");
            pending.remove(key)
        };

        match sender {
            Some(tx) => {
                let _ignored = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Drops the entry for `key` without signalling, so a cancelled waiter
    /// does not leak.
    fn drain(&self, key: &SyncKey) {
        let _ignored = self.pending.lock().expect("lock poisoned").remove(key);
    }

    /// Dismisses every waiter with a "sync closed" error. Idempotent.
    pub async fn close(&self) -> eyre::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let pending = {
            let mut pending = self.pending.lock().expect("lock poisoned");
            std::mem::take(&mut *pending)
        };

        if !pending.is_empty() {
            warn!(in_flight = pending.len(), "closing transfer with syncs in progress");
        }

        for (_, tx) in pending {
            let _ignored = tx.send(Err(SyncError::Closed));
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for Transfer {
    fn syncer(self: Arc<Self>, peer: PeerId, limiter: Option<Arc<PeerLimiter>>) -> Arc<dyn Syncer> {
        Arc::new(TransferSyncer {
            transfer: self,
            peer,
            limiter,
        })
    }

    async fn close(&self) -> eyre::Result<()> {
        Transfer::close(self).await
    }
}

/// Classifies a terminal wire event, logging per its severity.
fn classify(event: TransferEvent, root: &Cid, peer: &PeerId) -> Result<(), SyncError> {
    match event {
        TransferEvent::Completed => {
            info!(cid = %root, %peer, "transfer completed successfully");
            Ok(())
        }
        TransferEvent::Cancelled => {
            warn!(cid = %root, %peer, "transfer cancelled");
            Err(SyncError::Cancelled)
        }
        TransferEvent::Failed(message) => {
            error!(cid = %root, %peer, %message, "transfer failed");

            if message.contains(RATE_LIMIT_SENTINEL) {
                Err(SyncError::RateLimited)
            } else if let Some(prefix) = message.strip_suffix("content not found") {
                // NotFound's Display re-appends the annotation; hand it the
                // bare prefix so the phrase appears exactly once.
                let prefix = prefix.trim_end().trim_end_matches(':').trim_end();
                Err(SyncError::NotFound(prefix.to_owned()))
            } else {
                Err(SyncError::Transport(message))
            }
        }
    }
}

struct TransferSyncer {
    transfer: Arc<Transfer>,
    peer: PeerId,
    limiter: Option<Arc<PeerLimiter>>,
}

#[async_trait]
impl Syncer for TransferSyncer {
    async fn get_head(&self, token: &CancellationToken) -> Result<Option<Cid>, SyncError> {
        tokio::select! {
            head = self.transfer.exchange.head(self.peer) => head,
            () = token.cancelled() => Err(SyncError::Cancelled),
        }
    }

    async fn sync(
        &self,
        token: &CancellationToken,
        root: Cid,
        selector: Selector,
    ) -> Result<(), SyncError> {
        let key = (root, self.peer);
        let done = self.transfer.notify_on_done(key)?;

        let gate = self.transfer.ingest.gate();
        if let Some(limiter) = &self.limiter {
            gate.set_override(self.peer, Arc::clone(limiter));
        }

        let transfer = Arc::clone(&self.transfer);
        let request = TransferRequest {
            peer: self.peer,
            root,
            selector,
        };
        let exec_token = token.child_token();

        drop(tokio::spawn(async move {
            let blocks = Arc::clone(&transfer.ingest) as Arc<dyn BlockSink>;
            let event = transfer
                .exchange
                .execute(request, blocks, exec_token)
                .await;

            let result = classify(event, &key.0, &key.1);
            if !transfer.signal_done(&key, result) {
                debug!(cid = %key.0, peer = %key.1, "no waiter for finished transfer");
            }
        }));

        let result = tokio::select! {
            result = done => result.unwrap_or(Err(SyncError::Closed)),
            () = token.cancelled() => {
                self.transfer.drain(&key);
                Err(SyncError::Cancelled)
            }
        };

        if self.limiter.is_some() {
            gate.clear_override(&self.peer);
        }

        if !matches!(result, Err(SyncError::RateLimited)) {
            gate.finish_sync(&self.peer);
        }

        result
    }
}
