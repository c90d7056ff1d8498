use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::method_routing;
use axum::Router;
use axum_server::{Handle, Server};

use crate::metrics;
use crate::snapshot::SnapshotCache;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

async fn prometheus_metrics(State(cache): State<Arc<SnapshotCache>>) -> Response {
    let snapshot = cache.load();
    if !snapshot.is_ready() {
        return (StatusCode::SERVICE_UNAVAILABLE, "not ready\n").into_response();
    }

    let mut body = snapshot.render();
    body.push_str(&metrics::encode());
    ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response()
}

pub fn router(cache: Arc<SnapshotCache>) -> Router {
    Router::new()
        .route("/metrics", method_routing::get(prometheus_metrics))
        .with_state(cache)
}

pub struct Exporter {
    server: Server,
}

impl Exporter {
    pub fn new(addr: SocketAddr, handle: Handle) -> Self {
        let server = axum_server::bind(addr).handle(handle);

        Self { server }
    }

    pub async fn serve(self, cache: Arc<SnapshotCache>) -> std::io::Result<()> {
        self.server
            .serve(router(cache).into_make_service())
            .await
    }
}
