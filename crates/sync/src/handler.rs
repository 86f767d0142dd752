//! Per-publisher sync handlers.
//!
//! Every sync for one publisher, whether caller-directed or triggered by an
//! announcement, flows through that publisher's handler task, which consumes
//! its request queue serially. Queue order is start order, so finished
//! events for a publisher come out in the order their syncs began.

use std::sync::Arc;
use std::time::Duration;

use libp2p_identity::PeerId;
use tendril_primitives::Cid;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Shared, SyncFinished};
use crate::error::SyncError;
use crate::gate::PeerLimiter;
use crate::selector::{explore_with_stop, Selector};

/// Breather between retries while the gate keeps refusing blocks.
const RATE_LIMIT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub(crate) struct SyncRequest {
    /// Link to fetch; `None` resolves the publisher's head.
    pub target: Option<Cid>,

    /// Caller-supplied selector, used verbatim when present.
    pub selector: Option<Selector>,

    /// Per-sync rate limiter override.
    pub limiter: Option<Arc<PeerLimiter>>,

    /// Whether a successful sync replaces the latest-sync entry. True only
    /// for default syncs (no caller link, no caller selector) and for
    /// announcement dispatches.
    pub update_latest: bool,

    /// Receives the synced link on success, then closes; closes empty on
    /// failure or cancellation.
    pub response: Option<mpsc::Sender<Cid>>,

    pub token: CancellationToken,
}

pub(crate) struct Handler {
    queue: mpsc::UnboundedSender<SyncRequest>,
    task: JoinHandle<()>,
}

impl Handler {
    pub(crate) fn spawn(peer: PeerId, shared: Arc<Shared>) -> Self {
        let (queue, requests) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(peer, shared, requests));

        Self { queue, task }
    }

    pub(crate) fn enqueue(&self, request: SyncRequest) -> Result<(), SyncError> {
        self.queue.send(request).map_err(|_| SyncError::Closed)
    }

    pub(crate) async fn join(self) {
        drop(self.queue);
        let _ignored = self.task.await;
    }
}

async fn run(peer: PeerId, shared: Arc<Shared>, mut requests: mpsc::UnboundedReceiver<SyncRequest>) {
    loop {
        let request = tokio::select! {
            () = shared.token.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        handle_one(peer, &shared, request).await;
    }

    debug!(%peer, "publisher handler stopped");
}

/// Runs one sync to completion: resolve target, resolve selector, transfer
/// (retrying past rate limits), then finalize.
async fn handle_one(peer: PeerId, shared: &Arc<Shared>, request: SyncRequest) {
    let SyncRequest {
        target,
        selector,
        limiter,
        update_latest,
        response,
        token,
    } = request;

    // The stop link is the head we already hold, read before resolving the
    // target so a concurrent setter cannot move it mid-sync.
    let stop = shared.latest_sync(&peer);

    let syncer = Arc::clone(&shared.transport).syncer(peer, limiter);

    let resolved = match target {
        Some(cid) => Ok(cid),
        None => match syncer.get_head(&token).await {
            Ok(Some(cid)) => Ok(cid),
            Ok(None) => Err(SyncError::NoHead),
            Err(err) => Err(err),
        },
    };

    let root = match resolved {
        Ok(root) => root,
        Err(err) => {
            warn!(%peer, %err, "failed to resolve sync target");
            shared.publish(SyncFinished {
                peer,
                cid: target,
                error: Some(err.to_string()),
            });
            return;
        }
    };

    let selector =
        selector.unwrap_or_else(|| explore_with_stop(shared.default_selector.clone(), stop));

    let result = loop {
        match syncer.sync(&token, root, selector.clone()).await {
            Err(SyncError::RateLimited) => {
                debug!(%peer, cid = %root, "transfer hit rate limit, retrying");
                tokio::select! {
                    () = tokio::time::sleep(RATE_LIMIT_RETRY_DELAY) => {}
                    () = token.cancelled() => break Err(SyncError::Cancelled),
                }
            }
            result => break result,
        }
    };

    match result {
        Ok(()) => {
            if update_latest {
                shared.set_latest_sync(peer, root);
            }

            if let Some(response) = response {
                let _ignored = response.try_send(root);
            }

            info!(%peer, cid = %root, "sync finished successfully");
            shared.publish(SyncFinished {
                peer,
                cid: Some(root),
                error: None,
            });
        }
        Err(err) => {
            match err {
                SyncError::Cancelled => warn!(%peer, cid = %root, "sync cancelled"),
                ref err => error!(%peer, cid = %root, %err, "sync failed"),
            }

            // Dropping the response sender closes the caller's channel
            // without a value.
            shared.publish(SyncFinished {
                peer,
                cid: Some(root),
                error: Some(err.to_string()),
            });
        }
    }
}
