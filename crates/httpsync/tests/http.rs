use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use libp2p_identity::PeerId;
use serde_json::json;
use tendril_httpsync::{HttpPublisher, HttpTransport};
use tendril_primitives::{Cid, Node};
use tendril_store::{LinkStore, MemoryStore};
use tendril_sync::testing::{self, mk_chain};
use tendril_sync::{BlockIngest, Broker, Config, RateGate};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use url::Url;

const TOPIC: &str = "testnet";
const UPDATE_TIMEOUT: Duration = Duration::from_secs(5);

async fn serve(publisher: &Arc<HttpPublisher>) -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr: SocketAddr = listener.local_addr().unwrap();

    let router = publisher.router();
    drop(tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server runs");
    }));

    Url::parse(&format!("http://{addr}/")).unwrap()
}

struct Subscriber {
    broker: Broker,
    store: Arc<MemoryStore>,
    transport: Arc<HttpTransport>,
}

fn mk_subscriber() -> Subscriber {
    testing::init_tracing();

    let store = Arc::new(MemoryStore::new());
    let gate = Arc::new(RateGate::new(None));
    let ingest = Arc::new(BlockIngest::new(store.clone(), gate, None));
    let transport = HttpTransport::new(reqwest::Client::new(), TOPIC, ingest);

    let broker = Broker::with_transport(
        Config::new(TOPIC),
        PeerId::random(),
        transport.clone(),
        None,
        None,
    )
    .expect("broker starts");

    Subscriber {
        broker,
        store,
        transport,
    }
}

#[tokio::test]
async fn publisher_serves_head_and_blocks() {
    testing::init_tracing();

    let store = Arc::new(MemoryStore::new());
    let publisher = HttpPublisher::new(TOPIC, store.clone());
    let base = serve(&publisher).await;
    let client = reqwest::Client::new();

    // No root published yet: the head is the empty string.
    let head: String = client
        .get(base.join(&format!("{TOPIC}/head")).unwrap())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(head, "");

    let node = Node::leaf(json!("served over http"));
    let bytes = node.encode();
    let cid = Cid::hash(&bytes);
    store.put(&cid, &bytes).await.unwrap();
    publisher.update_root(cid);

    let head: String = client
        .get(base.join(&format!("{TOPIC}/head")).unwrap())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(head.parse::<Cid>().unwrap(), cid);

    // A stored block comes back as its canonical JSON.
    let response = client
        .get(base.join(&format!("{TOPIC}/{cid}")).unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let fetched = response.bytes().await.unwrap();
    assert_eq!(Node::decode(&fetched).unwrap(), node);

    // Unknown cid is a 404, an unparseable one a 400.
    let missing = Cid::hash(b"never stored");
    let response = client
        .get(base.join(&format!("{TOPIC}/{missing}")).unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let response = client
        .get(base.join(&format!("{TOPIC}/not-a-cid!")).unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn default_sync_over_http_follows_the_head() {
    let publisher_store = Arc::new(MemoryStore::new());
    let publisher = HttpPublisher::new(TOPIC, publisher_store.clone());
    let base = serve(&publisher).await;

    let subscriber = mk_subscriber();
    let peer = PeerId::random();
    subscriber.transport.register(peer, base);

    let chain = mk_chain(publisher_store.as_ref(), 4).await;
    publisher.update_root(chain[2]);

    let token = CancellationToken::new();
    let mut out = subscriber
        .broker
        .sync(&token, peer, None, None, None)
        .unwrap();
    let got = timeout(UPDATE_TIMEOUT, out.recv()).await.unwrap();
    assert_eq!(got, Some(chain[2]));
    assert_eq!(subscriber.broker.get_latest_sync(&peer), Some(chain[2]));
    for cid in &chain[..3] {
        assert!(subscriber.store.has(cid).await.unwrap());
    }

    // Advance the head: the next default sync moves only the delta and
    // stops at the previous head.
    publisher.update_root(chain[3]);

    let mut out = subscriber
        .broker
        .sync(&token, peer, None, None, None)
        .unwrap();
    let got = timeout(UPDATE_TIMEOUT, out.recv()).await.unwrap();
    assert_eq!(got, Some(chain[3]));
    assert_eq!(subscriber.broker.get_latest_sync(&peer), Some(chain[3]));
    assert!(subscriber.store.has(&chain[3]).await.unwrap());

    subscriber.broker.close().await.unwrap();
}

#[tokio::test]
async fn explicit_sync_over_http_leaves_latest_alone() {
    let publisher_store = Arc::new(MemoryStore::new());
    let publisher = HttpPublisher::new(TOPIC, publisher_store.clone());
    let base = serve(&publisher).await;

    let subscriber = mk_subscriber();
    let peer = PeerId::random();
    subscriber.transport.register(peer, base);

    let chain = mk_chain(publisher_store.as_ref(), 3).await;

    let token = CancellationToken::new();
    let mut out = subscriber
        .broker
        .sync(&token, peer, Some(chain[1]), None, None)
        .unwrap();
    let got = timeout(UPDATE_TIMEOUT, out.recv()).await.unwrap();
    assert_eq!(got, Some(chain[1]));

    assert!(subscriber.store.has(&chain[1]).await.unwrap());
    assert!(subscriber.store.has(&chain[0]).await.unwrap());
    assert_eq!(subscriber.broker.get_latest_sync(&peer), None);

    subscriber.broker.close().await.unwrap();
}

#[tokio::test]
async fn sync_against_an_unregistered_publisher_fails() {
    let subscriber = mk_subscriber();
    let mut watcher = subscriber.broker.on_sync_finished();

    let token = CancellationToken::new();
    let mut out = subscriber
        .broker
        .sync(&token, PeerId::random(), None, None, None)
        .unwrap();
    let got = timeout(UPDATE_TIMEOUT, out.recv()).await.unwrap();
    assert_eq!(got, None, "sync channel should have closed empty");

    let event = timeout(UPDATE_TIMEOUT, watcher.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(event.error.is_some());

    subscriber.broker.close().await.unwrap();
}

#[tokio::test]
async fn missing_blocks_fail_the_sync() {
    let publisher_store = Arc::new(MemoryStore::new());
    let publisher = HttpPublisher::new(TOPIC, publisher_store.clone());
    let base = serve(&publisher).await;

    let subscriber = mk_subscriber();
    let peer = PeerId::random();
    subscriber.transport.register(peer, base);

    // Announce a head the publisher does not possess.
    publisher.update_root(Cid::hash(b"phantom"));

    let token = CancellationToken::new();
    let mut out = subscriber
        .broker
        .sync(&token, peer, None, None, None)
        .unwrap();
    let got = timeout(UPDATE_TIMEOUT, out.recv()).await.unwrap();
    assert_eq!(got, None);
    assert_eq!(subscriber.broker.get_latest_sync(&peer), None);

    subscriber.broker.close().await.unwrap();
}
