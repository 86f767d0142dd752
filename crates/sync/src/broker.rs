//! The broker: demultiplexes announcements across publishers, hosts the
//! latest-sync map, and fans completed-sync events out to observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use libp2p_identity::PeerId;
use tendril_primitives::Cid;
use tendril_store::LinkStore;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::announce::{self, Announcement};
use crate::config::Config;
use crate::error::SyncError;
use crate::gate::{LimiterFor, PeerLimiter, RateGate};
use crate::handler::{Handler, SyncRequest};
use crate::selector::Selector;
use crate::transfer::{BlockHook, BlockIngest, GraphExchange, Transfer, Transport};

/// Published to every live observer after a sync terminates.
#[derive(Clone, Debug)]
pub struct SyncFinished {
    pub peer: PeerId,

    /// The sync target. Absent when the sync failed before the target could
    /// be resolved.
    pub cid: Option<Cid>,

    pub error: Option<String>,
}

/// State shared between the broker handle, its handler tasks, and the
/// announcement listener.
pub(crate) struct Shared {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) default_selector: Option<Selector>,
    pub(crate) token: CancellationToken,
    local_peer: PeerId,
    latest: RwLock<HashMap<PeerId, Cid>>,
    events: RwLock<Option<broadcast::Sender<SyncFinished>>>,
    handlers: Mutex<HashMap<PeerId, Handler>>,
    closed: AtomicBool,
}

impl Shared {
    pub(crate) fn latest_sync(&self, peer: &PeerId) -> Option<Cid> {
        self.latest.read().expect("lock poisoned").get(peer).copied()
    }

    pub(crate) fn set_latest_sync(&self, peer: PeerId, cid: Cid) {
        let _ignored = self.latest.write().expect("lock poisoned").insert(peer, cid);
        debug!(%peer, %cid, "latest sync updated");
    }

    pub(crate) fn publish(&self, event: SyncFinished) {
        let events = self.events.read().expect("lock poisoned");
        if let Some(sender) = events.as_ref() {
            // Err means no live observers; nothing to do.
            let _ignored = sender.send(event);
        }
    }
}

fn dispatch(shared: &Arc<Shared>, peer: PeerId, request: SyncRequest) -> Result<(), SyncError> {
    if shared.closed.load(Ordering::SeqCst) {
        return Err(SyncError::Closed);
    }

    let mut handlers = shared.handlers.lock().expect("lock poisoned");
    let handler = handlers
        .entry(peer)
        .or_insert_with(|| Handler::spawn(peer, Arc::clone(shared)));

    handler.enqueue(request)
}

/// Optional wiring for [`Broker::new`].
#[derive(Default)]
#[non_exhaustive]
pub struct BrokerOptions {
    /// Default exploration sequence; wrapped with a stop at the latest sync
    /// for every default sync. Absent means all edges, unbounded.
    pub default_selector: Option<Selector>,

    /// Invoked once per block a transfer brings in.
    pub block_hook: Option<BlockHook>,

    /// Per-peer limiter lookup. Overrides `Config::rate_limit`.
    pub limiter_for: Option<LimiterFor>,

    /// Root announcements from the pub/sub transport.
    pub announcements: Option<mpsc::Receiver<Announcement>>,
}

impl BrokerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_default_selector(mut self, selector: Selector) -> Self {
        self.default_selector = Some(selector);
        self
    }

    #[must_use]
    pub fn with_block_hook(mut self, hook: BlockHook) -> Self {
        self.block_hook = Some(hook);
        self
    }

    #[must_use]
    pub fn with_limiter_for(mut self, limiter_for: LimiterFor) -> Self {
        self.limiter_for = Some(limiter_for);
        self
    }

    #[must_use]
    pub fn with_announcements(mut self, announcements: mpsc::Receiver<Announcement>) -> Self {
        self.announcements = Some(announcements);
        self
    }
}

/// Subscriber-side sync broker (see the crate docs for the data flow).
pub struct Broker {
    shared: Arc<Shared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Creates a broker fetching blocks over `exchange` into `store`.
    pub fn new(
        config: Config,
        local_peer: PeerId,
        store: Arc<dyn LinkStore>,
        exchange: Arc<dyn GraphExchange>,
        mut options: BrokerOptions,
    ) -> eyre::Result<Self> {
        let limiter_for = options
            .limiter_for
            .take()
            .or_else(|| config.rate_limit.map(RateGate::keyed));

        let gate = Arc::new(RateGate::new(limiter_for));
        let ingest = Arc::new(BlockIngest::new(store, gate, options.block_hook.take()));
        let transport = Transfer::new(exchange, ingest);

        Self::with_transport(
            config,
            local_peer,
            transport,
            options.default_selector.take(),
            options.announcements.take(),
        )
    }

    /// Creates a broker over an already-assembled transport. This is how
    /// alternate transports (e.g. HTTP) reuse the handler semantics.
    pub fn with_transport(
        config: Config,
        local_peer: PeerId,
        transport: Arc<dyn Transport>,
        default_selector: Option<Selector>,
        announcements: Option<mpsc::Receiver<Announcement>>,
    ) -> eyre::Result<Self> {
        let (events, _) = broadcast::channel(config.observer_capacity.max(1));

        let shared = Arc::new(Shared {
            transport,
            default_selector,
            token: CancellationToken::new(),
            local_peer,
            latest: RwLock::new(HashMap::new()),
            events: RwLock::new(Some(events)),
            handlers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let listener = announcements.map(|rx| tokio::spawn(listen(Arc::clone(&shared), rx)));

        info!(topic = %config.topic, %local_peer, "broker started");

        Ok(Self {
            shared,
            listener: Mutex::new(listener),
        })
    }

    /// Dispatches a sync to `peer`'s handler.
    ///
    /// Returns a single-buffered channel that yields the synced link on
    /// success (then closes) or closes without a value on failure or
    /// cancellation. A default sync (`cid` and `selector` both `None`)
    /// fetches the publisher's current head and advances the latest sync on
    /// success; anything caller-directed leaves the latest sync untouched.
    pub fn sync(
        &self,
        token: &CancellationToken,
        peer: PeerId,
        cid: Option<Cid>,
        selector: Option<Selector>,
        limiter: Option<Arc<PeerLimiter>>,
    ) -> Result<mpsc::Receiver<Cid>, SyncError> {
        let (response, receiver) = mpsc::channel(1);
        let update_latest = cid.is_none() && selector.is_none();

        dispatch(
            &self.shared,
            peer,
            SyncRequest {
                target: cid,
                selector,
                limiter,
                update_latest,
                response: Some(response),
                token: token.clone(),
            },
        )?;

        Ok(receiver)
    }

    /// Registers an observer for finished syncs. Observers registered after
    /// an event are not back-filled.
    pub fn on_sync_finished(&self) -> SyncFinishedSubscription {
        let events = self.shared.events.read().expect("lock poisoned");

        SyncFinishedSubscription {
            receiver: events.as_ref().map(broadcast::Sender::subscribe),
        }
    }

    /// Snapshot read of the latest fully-synced link for `peer`.
    pub fn get_latest_sync(&self, peer: &PeerId) -> Option<Cid> {
        self.shared.latest_sync(peer)
    }

    /// Caller-directed override, intended for recovery from persistent
    /// storage.
    pub fn set_latest_sync(&self, peer: PeerId, cid: Cid) -> Result<(), SyncError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }

        self.shared.set_latest_sync(peer, cid);

        Ok(())
    }

    /// Shuts down handlers, the announcement listener, and the transport;
    /// closes every observer channel exactly once. Idempotent.
    pub async fn close(&self) -> eyre::Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shared.token.cancel();

        // Free any in-flight waiters before joining their handlers.
        self.shared.transport.close().await?;

        let handlers = {
            let mut handlers = self.shared.handlers.lock().expect("lock poisoned");
            std::mem::take(&mut *handlers)
        };
        for (_, handler) in handlers {
            handler.join().await;
        }

        let listener = self.listener.lock().expect("lock poisoned").take();
        if let Some(listener) = listener {
            let _ignored = listener.await;
        }

        // Dropping the sender closes every observer channel.
        let _ignored = self.shared.events.write().expect("lock poisoned").take();

        info!("broker closed");

        Ok(())
    }
}

async fn listen(shared: Arc<Shared>, mut announcements: mpsc::Receiver<Announcement>) {
    loop {
        let announcement = tokio::select! {
            () = shared.token.cancelled() => break,
            announcement = announcements.recv() => match announcement {
                Some(announcement) => announcement,
                None => break,
            },
        };

        let Some((peer, cid)) = announce::decode(&shared.local_peer, &announcement) else {
            continue;
        };

        debug!(%peer, %cid, "root announcement received");

        // An announcement is a default sync with the announced link as the
        // target: it advances the latest sync on success.
        let request = SyncRequest {
            target: Some(cid),
            selector: None,
            limiter: None,
            update_latest: true,
            response: None,
            token: CancellationToken::new(),
        };

        if let Err(err) = dispatch(&shared, peer, request) {
            warn!(%peer, %cid, %err, "dropping announcement");
        }
    }

    debug!("announcement listener stopped");
}

/// Observer handle returned by [`Broker::on_sync_finished`].
///
/// Backpressure policy: each observer has a bounded buffer
/// (`Config::observer_capacity`); a lagging observer loses the oldest
/// buffered events, counted and logged, while other observers and the
/// handlers stay unaffected.
pub struct SyncFinishedSubscription {
    receiver: Option<broadcast::Receiver<SyncFinished>>,
}

impl SyncFinishedSubscription {
    /// Receives the next event; `None` once the subscription is cancelled
    /// or the broker is closed.
    pub async fn recv(&mut self) -> Option<SyncFinished> {
        loop {
            match self.receiver.as_mut()?.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    warn!(dropped, "observer lagging, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Removes the observer and closes its channel. Safe to call more than
    /// once, and after the broker is closed.
    pub fn cancel(&mut self) {
        self.receiver = None;
    }
}
