//! Core server: accepts connections and runs one session per client.
//!
//! Owns the session registry, the identity verifier and the shutdown signal.
//! Coordinates the lifecycle of all incoming connections and the admin
//! endpoint.

use crate::admin;
use crate::config::ServerConfig;
use crate::identity::IdentityVerifier;
use crate::registry::SessionRegistry;
use crate::session::{CloseReason, Session, SessionOptions};
use crate::transport::websocket;
use chatgate_core::{GateError, GateResult, MessageChannel};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

/// How long shutdown waits for sessions to close their transports.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The gateway server instance.
pub struct GatewayServer {
    /// Server configuration.
    config: ServerConfig,
    /// Settings handed to every session.
    options: SessionOptions,
    /// Identity service client.
    verifier: Arc<dyn IdentityVerifier>,
    /// Authenticated sessions.
    registry: Arc<SessionRegistry>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl GatewayServer {
    /// Create a new server instance.
    pub fn new(config: ServerConfig, verifier: Arc<dyn IdentityVerifier>) -> Self {
        let options = SessionOptions::from(&config);
        Self {
            config,
            options,
            verifier,
            registry: Arc::new(SessionRegistry::new()),
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The registry of authenticated sessions.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Run a session over `channel` on its own task.
    pub fn serve_channel<C>(&self, channel: C) -> JoinHandle<CloseReason>
    where
        C: MessageChannel + 'static,
    {
        tokio::spawn(self.new_session(channel).run())
    }

    fn new_session<C: MessageChannel>(&self, channel: C) -> Session<C> {
        Session::new(
            channel,
            self.options.clone(),
            self.verifier.clone(),
            self.registry.clone(),
            self.shutdown_tx.subscribe(),
        )
    }

    /// Bind the configured addresses and serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> GateResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ws_listener = websocket::bind(self.config.listen).await?;
        let admin_listener = TcpListener::bind(self.config.admin_listen)
            .await
            .map_err(|e| GateError::Transport(format!("admin bind failed: {e}")))?;
        self.serve(ws_listener, admin_listener, shutdown).await
    }

    /// Serve on already-bound listeners until `shutdown` resolves.
    pub async fn serve<F>(
        self,
        ws_listener: TcpListener,
        admin_listener: TcpListener,
        shutdown: F,
    ) -> GateResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ws_addr = ws_listener.local_addr()?;
        let admin_addr = admin_listener.local_addr()?;
        let mut ws_rx = websocket::start_listener(ws_listener);

        let mut admin_shutdown = self.shutdown_tx.subscribe();
        let admin_task = tokio::spawn(admin::serve(
            admin_listener,
            self.registry.clone(),
            async move {
                let _ = admin_shutdown.recv().await;
            },
        ));

        info!(
            listen = %ws_addr,
            admin = %admin_addr,
            relay = ?self.config.relay,
            "chatgate-server ready"
        );

        let mut sessions: JoinSet<CloseReason> = JoinSet::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                Some(conn) = ws_rx.recv() => {
                    info!(remote = %conn.remote_addr, "handling WebSocket connection");
                    sessions.spawn(self.new_session(conn).run());
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "session task failed");
                    }
                }
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                else => {
                    info!("listener closed, shutting down");
                    break;
                }
            }
        }

        self.shutdown().await;
        drop(ws_rx);
        drain_sessions(&mut sessions).await;
        match admin_task.await {
            Ok(result) => result,
            Err(e) => Err(GateError::Other(format!("admin task failed: {e}"))),
        }
    }

    /// Tell every session to close and drain the registry.
    pub async fn shutdown(&self) {
        info!("broadcasting shutdown to connected clients");
        let _ = self.shutdown_tx.send(());
        self.registry.close_all().await;
    }
}

/// Wait for sessions to finish closing, aborting stragglers after the grace
/// period.
async fn drain_sessions(sessions: &mut JoinSet<CloseReason>) {
    if sessions.is_empty() {
        return;
    }
    info!(sessions = sessions.len(), "waiting for sessions to close");
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "session task failed");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = sessions.len(),
            "sessions did not close within the grace period, aborting"
        );
        sessions.abort_all();
    }
}
