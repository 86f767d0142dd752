//! In-memory fixtures: a pub/sub topic, publishers, and a wire exchange
//! that traverses a publisher's store under the request selector. Enabled
//! with the `testing` feature.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, Once, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use libp2p_identity::PeerId;
use serde_json::json;
use tendril_primitives::{Cid, Node};
use tendril_store::{LinkStore, MemoryStore};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::announce::Announcement;
use crate::error::SyncError;
use crate::transfer::{BlockSink, GraphExchange, TransferEvent, TransferRequest};

pub fn init_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ignored = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

type Subscribers = Mutex<Vec<mpsc::Sender<Announcement>>>;

/// An in-memory pub/sub mesh plus the publishers attached to it.
#[derive(Default)]
pub struct TestNet {
    publishers: DashMap<PeerId, Arc<TestPublisher>>,
    subscribers: Arc<Subscribers>,
}

impl TestNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a publisher with its own store and a random identity.
    pub fn publisher(&self) -> Arc<TestPublisher> {
        let publisher = Arc::new(TestPublisher {
            peer: PeerId::random(),
            store: Arc::new(MemoryStore::new()),
            head: RwLock::new(None),
            subscribers: Arc::clone(&self.subscribers),
        });

        let _ignored = self
            .publishers
            .insert(publisher.peer, Arc::clone(&publisher));

        publisher
    }

    /// Subscribes to the announcement topic.
    pub fn subscribe(&self) -> mpsc::Receiver<Announcement> {
        let (sender, receiver) = mpsc::channel(16);
        self.subscribers.lock().expect("lock poisoned").push(sender);
        receiver
    }

    fn lookup(&self, peer: &PeerId) -> Option<Arc<TestPublisher>> {
        self.publishers.get(peer).map(|p| Arc::clone(&p))
    }
}

/// A publisher on the test mesh: a content-addressed store, an advertised
/// head, and the ability to announce new roots.
pub struct TestPublisher {
    peer: PeerId,
    store: Arc<MemoryStore>,
    head: RwLock<Option<Cid>>,
    subscribers: Arc<Subscribers>,
}

impl TestPublisher {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn head(&self) -> Option<Cid> {
        *self.head.read().expect("lock poisoned")
    }

    pub async fn store_node(&self, node: &Node) -> Cid {
        let bytes = node.encode();
        let cid = Cid::hash(&bytes);
        self.store.put(&cid, &bytes).await.expect("store accepts its own hash");
        cid
    }

    /// Advertises `cid` as the current head without announcing it.
    pub fn set_root(&self, cid: Cid) {
        *self.head.write().expect("lock poisoned") = Some(cid);
    }

    /// Advertises `cid` and announces it on the topic.
    pub async fn update_root(&self, cid: Cid) {
        self.set_root(cid);
        self.announce(Announcement::new(self.peer, cid.to_bytes())).await;
    }

    /// Publishes a raw payload on the topic, e.g. to exercise malformed
    /// announcements.
    pub async fn announce(&self, announcement: Announcement) {
        let subscribers = self.subscribers.lock().expect("lock poisoned").clone();
        for subscriber in subscribers {
            let _ignored = subscriber.send(announcement.clone()).await;
        }
    }
}

/// Wire exchange against the test mesh: breadth-first traversal of the
/// publisher's store under the request selector, delivering every visited
/// block to the sink. Blocks the subscriber already holds ride along with
/// `size_on_wire == 0`.
pub struct MemoryExchange {
    net: Arc<TestNet>,
    local: Arc<dyn LinkStore>,
}

impl MemoryExchange {
    pub fn new(net: Arc<TestNet>, local: Arc<dyn LinkStore>) -> Arc<Self> {
        Arc::new(Self { net, local })
    }
}

#[async_trait]
impl GraphExchange for MemoryExchange {
    async fn execute(
        &self,
        request: TransferRequest,
        blocks: Arc<dyn BlockSink>,
        token: CancellationToken,
    ) -> TransferEvent {
        let Some(publisher) = self.net.lookup(&request.peer) else {
            return TransferEvent::Failed(format!("peer {} unreachable", request.peer));
        };

        let mut queue = VecDeque::from([(request.root, 0_u64)]);
        let mut visited = HashSet::from([request.root]);

        while let Some((cid, depth)) = queue.pop_front() {
            if token.is_cancelled() {
                return TransferEvent::Cancelled;
            }

            if request.selector.is_stop(&cid) {
                continue;
            }

            let bytes = match publisher.store.load(&cid).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return TransferEvent::Failed(format!("block {cid}: content not found")),
                Err(err) => return TransferEvent::Failed(err.to_string()),
            };

            let size_on_wire = match self.local.has(&cid).await {
                Ok(true) => 0,
                _ => bytes.len(),
            };

            if let Err(rejected) = blocks.deliver(request.peer, cid, &bytes, size_on_wire).await {
                return TransferEvent::Failed(rejected.to_string());
            }

            if !request.selector.should_recurse(depth) {
                continue;
            }

            let node = match Node::decode(&bytes) {
                Ok(node) => node,
                Err(err) => return TransferEvent::Failed(format!("block {cid}: {err}")),
            };

            for link in node.links {
                if visited.insert(link) {
                    queue.push_back((link, depth + 1));
                }
            }
        }

        TransferEvent::Completed
    }

    async fn head(&self, peer: PeerId) -> Result<Option<Cid>, SyncError> {
        match self.net.lookup(&peer) {
            Some(publisher) => Ok(publisher.head()),
            None => Err(SyncError::Head(format!("peer {peer} unreachable"))),
        }
    }
}

/// Builds a linked chain of `len` blocks in `store` and returns their cids
/// in creation order: each block links back to the previous one, so the
/// last cid is the newest head and reaches every older block.
pub async fn mk_chain(store: &dyn LinkStore, len: usize) -> Vec<Cid> {
    mk_chain_tagged(store, len, "chain").await
}

/// Like [`mk_chain`] but with a tag mixed into every payload, for tests
/// that need distinct chains per publisher.
pub async fn mk_chain_tagged(store: &dyn LinkStore, len: usize, tag: &str) -> Vec<Cid> {
    let mut cids = Vec::with_capacity(len);

    for height in 0..len {
        let links = cids.last().map(|cid| vec![*cid]).unwrap_or_default();
        let node = Node::with_links(links, json!({ "tag": tag, "height": height }));

        let bytes = node.encode();
        let cid = Cid::hash(&bytes);
        store.put(&cid, &bytes).await.expect("store accepts its own hash");

        cids.push(cid);
    }

    cids
}
