use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use libp2p_identity::PeerId;
use tendril_primitives::{Cid, Node};
use tendril_store::LinkStore;
use tendril_sync::{BlockIngest, BlockSink, PeerLimiter, Selector, SyncError, Syncer, Transport};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// HTTP-backed transport: one registered base URL per publisher, blocks
/// fetched client-side and fed through the shared ingest pipeline.
pub struct HttpTransport {
    client: reqwest::Client,
    topic: String,
    ingest: Arc<BlockIngest>,
    publishers: DashMap<PeerId, Url>,
    closed: AtomicBool,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, topic: impl Into<String>, ingest: Arc<BlockIngest>) -> Arc<Self> {
        Arc::new(Self {
            client,
            topic: topic.into(),
            ingest,
            publishers: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Associates `peer` with the base URL its publisher serves under.
    pub fn register(&self, peer: PeerId, base: Url) {
        let _ignored = self.publishers.insert(peer, base);
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn syncer(self: Arc<Self>, peer: PeerId, limiter: Option<Arc<PeerLimiter>>) -> Arc<dyn Syncer> {
        Arc::new(HttpSyncer {
            transport: self,
            peer,
            limiter,
        })
    }

    async fn close(&self) -> eyre::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct HttpSyncer {
    transport: Arc<HttpTransport>,
    peer: PeerId,
    limiter: Option<Arc<PeerLimiter>>,
}

impl HttpSyncer {
    fn url(&self, tail: &str) -> Result<Url, SyncError> {
        let base = self
            .transport
            .publishers
            .get(&self.peer)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SyncError::Transport(format!("no address for publisher {}", self.peer)))?;

        base.join(&format!("{}/{tail}", self.transport.topic))
            .map_err(|err| SyncError::Transport(err.to_string()))
    }

    async fn fetch_head(&self) -> Result<Option<Cid>, SyncError> {
        let url = self.url("head")?;

        let response = self
            .transport
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| SyncError::Head(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SyncError::Head(format!("status {}", response.status())));
        }

        let head: String = response
            .json()
            .await
            .map_err(|err| SyncError::Head(err.to_string()))?;

        if head.is_empty() {
            return Ok(None);
        }

        head.parse()
            .map(Some)
            .map_err(|err| SyncError::Head(format!("invalid head cid: {err}")))
    }

    /// Fetches one block; `None` when the publisher answers 404.
    async fn fetch_block(&self, cid: &Cid) -> Result<Option<Vec<u8>>, SyncError> {
        let url = self.url(&cid.to_string())?;

        let response = self
            .transport
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| SyncError::Transport(err.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(SyncError::Transport(format!(
                "fetching {cid}: status {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| SyncError::Transport(err.to_string()))?;

        Ok(Some(bytes.to_vec()))
    }

    /// Client-driven traversal: fetch, deliver through the ingest pipeline,
    /// recurse per the selector. Blocks already held locally ride through
    /// with zero size-on-wire.
    async fn fetch_dag(
        &self,
        token: &CancellationToken,
        root: Cid,
        selector: &Selector,
    ) -> Result<(), SyncError> {
        let local = self.transport.ingest.store();

        let mut queue = VecDeque::from([(root, 0_u64)]);
        let mut visited = HashSet::from([root]);

        while let Some((cid, depth)) = queue.pop_front() {
            if self.transport.closed.load(Ordering::SeqCst) {
                return Err(SyncError::Closed);
            }
            if token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            if selector.is_stop(&cid) {
                continue;
            }

            let (bytes, size_on_wire) = if local.has(&cid).await? {
                let bytes = local
                    .load(&cid)
                    .await?
                    .map(|b| b.into_vec())
                    .ok_or_else(|| SyncError::Transport(format!("block {cid} vanished")))?;
                (bytes, 0)
            } else {
                let bytes = self
                    .fetch_block(&cid)
                    .await?
                    .ok_or_else(|| SyncError::NotFound(format!("block {cid}")))?;
                let size = bytes.len();
                (bytes, size)
            };

            if let Err(rejected) = self
                .transport
                .ingest
                .deliver(self.peer, cid, &bytes, size_on_wire)
                .await
            {
                if rejected.is_rate_limit() {
                    return Err(SyncError::RateLimited);
                }
                return Err(SyncError::Transport(rejected.message().to_owned()));
            }

            if !selector.should_recurse(depth) {
                continue;
            }

            let node = Node::decode(&bytes)
                .map_err(|err| SyncError::Transport(format!("block {cid}: {err}")))?;

            for link in node.links {
                if visited.insert(link) {
                    queue.push_back((link, depth + 1));
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Syncer for HttpSyncer {
    async fn get_head(&self, token: &CancellationToken) -> Result<Option<Cid>, SyncError> {
        tokio::select! {
            head = self.fetch_head() => head,
            () = token.cancelled() => Err(SyncError::Cancelled),
        }
    }

    async fn sync(
        &self,
        token: &CancellationToken,
        root: Cid,
        selector: Selector,
    ) -> Result<(), SyncError> {
        let gate = self.transport.ingest.gate();

        if let Some(limiter) = &self.limiter {
            gate.set_override(self.peer, Arc::clone(limiter));
        }

        let result = self.fetch_dag(token, root, &selector).await;

        if self.limiter.is_some() {
            gate.clear_override(&self.peer);
        }

        if !matches!(result, Err(SyncError::RateLimited)) {
            gate.finish_sync(&self.peer);
        }

        match &result {
            Ok(()) => info!(cid = %root, peer = %self.peer, "transfer completed successfully"),
            Err(SyncError::Cancelled) => warn!(cid = %root, peer = %self.peer, "transfer cancelled"),
            Err(SyncError::RateLimited) => {
                debug!(cid = %root, peer = %self.peer, "transfer rate limited")
            }
            Err(err) => error!(cid = %root, peer = %self.peer, %err, "transfer failed"),
        }

        result
    }
}
