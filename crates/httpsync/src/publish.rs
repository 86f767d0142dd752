use std::sync::{Arc, RwLock};

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tendril_primitives::Cid;
use tendril_store::LinkStore;
use tracing::{debug, error};

/// Serves a publisher's head and blocks over HTTP.
///
/// `GET /{topic}/head` answers the JSON-encoded string of the current root
/// (the empty string while no root has been published); `GET /{topic}/{cid}`
/// answers the block's canonical JSON, 404 when absent, 400 when the path
/// segment is not a valid link.
pub struct HttpPublisher {
    topic: String,
    root: RwLock<Option<Cid>>,
    store: Arc<dyn LinkStore>,
}

impl HttpPublisher {
    pub fn new(topic: impl Into<String>, store: Arc<dyn LinkStore>) -> Arc<Self> {
        Arc::new(Self {
            topic: topic.into(),
            root: RwLock::new(None),
            store,
        })
    }

    pub fn update_root(&self, cid: Cid) {
        *self.root.write().expect("lock poisoned") = Some(cid);
        debug!(%cid, "published new root");
    }

    pub fn root(&self) -> Option<Cid> {
        *self.root.read().expect("lock poisoned")
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/:topic/head", get(serve_head))
            .route("/:topic/:cid", get(serve_block))
            .with_state(Arc::clone(self))
    }
}

async fn serve_head(
    State(publisher): State<Arc<HttpPublisher>>,
    Path(topic): Path<String>,
) -> Response {
    if topic != publisher.topic {
        return StatusCode::NOT_FOUND.into_response();
    }

    let root = publisher.root().map(|cid| cid.to_string()).unwrap_or_default();

    Json(root).into_response()
}

async fn serve_block(
    State(publisher): State<Arc<HttpPublisher>>,
    Path((topic, cid)): Path<(String, String)>,
) -> Response {
    if topic != publisher.topic {
        return StatusCode::NOT_FOUND.into_response();
    }

    let Ok(cid) = cid.parse::<Cid>() else {
        return (StatusCode::BAD_REQUEST, "invalid request: not a cid").into_response();
    };

    match publisher.store.load(&cid).await {
        Ok(Some(bytes)) => (
            [(header::CONTENT_TYPE, "application/json")],
            bytes.into_vec(),
        )
            .into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "cid not found").into_response(),
        Err(err) => {
            error!(%cid, %err, "failed to load requested block");
            (StatusCode::INTERNAL_SERVER_ERROR, "unable to load data for cid").into_response()
        }
    }
}
