use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const TILES_PATH: &str = "/api/v1/home/products/tiles";
pub const WISHLIST_PATH: &str = "/api/v1/home/wishlist/items";

#[derive(Clone, Default)]
pub struct OriginState {
    inner: Arc<OriginInner>,
}

#[derive(Default)]
struct OriginInner {
    tiles_hits: AtomicUsize,
    wishlist_hits: AtomicUsize,
    faults: RwLock<HashMap<String, StatusCode>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HitCounts {
    pub tiles: usize,
    pub wishlist: usize,
}

impl HitCounts {
    #[inline]
    #[must_use]
    pub fn total(&self) -> usize {
        self.tiles + self.wishlist
    }
}

impl OriginState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request on `path` with `status` and an empty body.
    pub fn fail_path(&self, path: impl Into<String>, status: StatusCode) {
        self.inner.faults.write().insert(path.into(), status);
    }

    pub fn clear_faults(&self) {
        self.inner.faults.write().clear();
    }

    #[inline]
    #[must_use]
    pub fn hits(&self) -> HitCounts {
        HitCounts {
            tiles: self.inner.tiles_hits.load(Ordering::Acquire),
            wishlist: self.inner.wishlist_hits.load(Ordering::Acquire),
        }
    }

    fn fault_for(&self, path: &str) -> Option<StatusCode> {
        self.inner.faults.read().get(path).copied()
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct TilesQuery {
    #[serde(rename = "itemCodes")]
    pub item_codes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProductTile {
    pub item_code: String,
    pub title: String,
    pub price_cents: u64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct TilesResponse {
    pub tiles: Vec<ProductTile>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct WishlistResponse {
    pub items: Vec<String>,
}

pub fn router(state: OriginState) -> Router {
    Router::new()
        .route(TILES_PATH, get(get_tiles))
        .route(WISHLIST_PATH, get(get_wishlist))
        .with_state(state)
}

async fn get_tiles(State(state): State<OriginState>, Query(query): Query<TilesQuery>) -> Response {
    state.inner.tiles_hits.fetch_add(1, Ordering::AcqRel);
    if let Some(status) = state.fault_for(TILES_PATH) {
        return status.into_response();
    }
    let tiles = query
        .item_codes
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter(|code| !code.is_empty())
        .map(|code| ProductTile {
            item_code: code.to_string(),
            title: format!("Product {code}"),
            price_cents: 1999,
        })
        .collect();
    Json(TilesResponse { tiles }).into_response()
}

async fn get_wishlist(State(state): State<OriginState>) -> Response {
    state.inner.wishlist_hits.fetch_add(1, Ordering::AcqRel);
    if let Some(status) = state.fault_for(WISHLIST_PATH) {
        return status.into_response();
    }
    Json(WishlistResponse {
        items: vec!["I-015503".to_string()],
    })
    .into_response()
}

pub async fn serve(listener: TcpListener, state: OriginState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

/// A stub origin running on a background task, stopped on drop.
pub struct SpawnedOrigin {
    addr: SocketAddr,
    state: OriginState,
    handle: JoinHandle<()>,
}

impl SpawnedOrigin {
    /// Binds `127.0.0.1:0` and serves the stub until dropped.
    pub async fn start(state: OriginState) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind stub origin")?;
        let addr = listener
            .local_addr()
            .context("Failed to read stub origin address")?;
        let serve_state = state.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = serve(listener, serve_state).await {
                tracing::error!(%addr, error = %e, "stub origin stopped");
            }
        });
        Ok(Self {
            addr,
            state,
            handle,
        })
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    #[must_use]
    pub fn state(&self) -> &OriginState {
        &self.state
    }
}

impl Drop for SpawnedOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
