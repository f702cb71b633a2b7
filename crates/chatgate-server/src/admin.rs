//! Administrative HTTP endpoint.
//!
//! `GET|POST /update` pushes the fixed `update` envelope to every registered
//! session. `GET /sessions` lists who is connected.

use crate::registry::SessionRegistry;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chatgate_core::{Envelope, GateResult};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<SessionRegistry>,
}

/// Creates the admin router.
pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/update", get(update_handler).post(update_handler))
        .route("/sessions", get(sessions_handler))
        .with_state(AdminState { registry })
}

/// Serve the admin router until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, registry: Arc<SessionRegistry>, shutdown: F) -> GateResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "admin listener started");
    }
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Broadcast the update envelope. Per-recipient failures never reach the caller.
async fn update_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let report = state.registry.broadcast(&Envelope::update()).await;
    info!(
        delivered = report.delivered,
        dropped = report.dropped,
        "admin update broadcast"
    );
    (StatusCode::OK, "OK")
}

async fn sessions_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let sessions = state.registry.list().await;
    Json(serde_json::json!({
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgate_core::MsgType;
    use std::net::SocketAddr;
    use tokio::sync::{mpsc, oneshot};

    async fn spawn_admin(registry: Arc<SessionRegistry>) -> (SocketAddr, oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        tokio::spawn(serve(listener, registry, async move {
            let _ = stop_rx.await;
        }));
        (addr, stop_tx)
    }

    #[tokio::test]
    async fn update_broadcasts_and_acknowledges() {
        let registry = Arc::new(SessionRegistry::new());
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, rx2) = mpsc::channel(4);
        let (tx3, mut rx3) = mpsc::channel(4);
        registry.register("s1", "u1", tx1).await;
        registry.register("s2", "u2", tx2).await;
        registry.register("s3", "u3", tx3).await;
        drop(rx2);

        let (addr, _stop) = spawn_admin(registry.clone()).await;
        let response = reqwest::Client::new()
            .post(format!("http://{addr}/update"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "OK");

        for rx in [&mut rx1, &mut rx3] {
            let env = rx.recv().await.unwrap();
            assert_eq!(env.msg_type, MsgType::Update);
        }
        assert_eq!(registry.count().await, 2);
    }

    #[tokio::test]
    async fn update_with_no_sessions_still_ok() {
        let (addr, _stop) = spawn_admin(Arc::new(SessionRegistry::new())).await;
        let response = reqwest::get(format!("http://{addr}/update")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn sessions_lists_members() {
        let registry = Arc::new(SessionRegistry::new());
        let (tx, _rx) = mpsc::channel(4);
        registry.register("abc", "user-1", tx).await;

        let (addr, _stop) = spawn_admin(registry).await;
        let body: serde_json::Value = reqwest::get(format!("http://{addr}/sessions"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["session_id"], "abc");
        assert_eq!(body["sessions"][0]["user_id"], "user-1");
    }
}
