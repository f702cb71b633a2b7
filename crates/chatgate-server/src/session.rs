//! Per-connection session: challenge, authentication gate, chat relay.
//!
//! Lifecycle:
//! 1. Server sends an `authenticate` challenge as soon as the session starts
//! 2. Client answers with `authenticate` carrying `{"bearer", "user_uuid"}`
//! 3. Server verifies the credentials with the identity service, registers
//!    the session and replies `authenticated` with the verified profile
//! 4. Every later client envelope is re-tagged `chat` and relayed
//!
//! Any violation, verification failure, timeout or transport error closes
//! the session. The session is unregistered and its channel closed on every
//! exit path.

use crate::config::{RelayPolicy, ServerConfig};
use crate::identity::IdentityVerifier;
use crate::registry::SessionRegistry;
use chatgate_core::{
    decode, encode, AuthenticationInput, Envelope, GateError, MessageChannel, MsgType,
};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Handshake progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingChallenge,
    ChallengeSent,
    Authenticated,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the connection.
    ClientClosed,
    /// No answer to the challenge within the deadline.
    AuthTimeout,
    /// Wrong message for the current state, or an unparsable message.
    ProtocolViolation(String),
    /// The identity service rejected the credentials or failed.
    VerificationFailed(String),
    /// Reading from or writing to the channel failed.
    Transport(String),
    /// Server shutdown, or the registry dropped this session.
    Shutdown,
}

impl CloseReason {
    /// Text for the optional `error` envelope sent before closing.
    fn diagnostic(&self) -> Option<String> {
        match self {
            CloseReason::AuthTimeout => Some("authentication timed out".into()),
            CloseReason::ProtocolViolation(why) => Some(format!("protocol violation: {why}")),
            CloseReason::VerificationFailed(_) => Some("authentication failed".into()),
            CloseReason::Shutdown => Some("server shutting down".into()),
            CloseReason::ClientClosed | CloseReason::Transport(_) => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => f.write_str("client closed"),
            CloseReason::AuthTimeout => f.write_str("authentication timed out"),
            CloseReason::ProtocolViolation(why) => write!(f, "protocol violation: {why}"),
            CloseReason::VerificationFailed(why) => write!(f, "verification failed: {why}"),
            CloseReason::Transport(why) => write!(f, "transport error: {why}"),
            CloseReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

impl From<GateError> for CloseReason {
    fn from(e: GateError) -> Self {
        match e {
            GateError::Codec(why) | GateError::Protocol(why) => CloseReason::ProtocolViolation(why),
            GateError::AuthFailed(why) => CloseReason::VerificationFailed(why),
            other => CloseReason::Transport(other.to_string()),
        }
    }
}

/// Per-session settings taken from the server config.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub auth_timeout: Duration,
    pub relay: RelayPolicy,
    pub challenge: String,
    pub error_envelopes: bool,
    pub outbox_capacity: usize,
}

impl From<&ServerConfig> for SessionOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            auth_timeout: config.auth_timeout,
            relay: config.relay,
            challenge: config.challenge.clone(),
            error_envelopes: config.error_envelopes,
            outbox_capacity: config.outbox_capacity,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// One client connection and its protocol state.
pub struct Session<C: MessageChannel> {
    id: String,
    channel: C,
    state: SessionState,
    /// Verified user id and profile, set once authenticated.
    identity: Option<(String, String)>,
    options: SessionOptions,
    verifier: Arc<dyn IdentityVerifier>,
    registry: Arc<SessionRegistry>,
    /// Handed to the registry on authentication.
    outbox_tx: Option<mpsc::Sender<Envelope>>,
    outbox_rx: mpsc::Receiver<Envelope>,
    shutdown: broadcast::Receiver<()>,
}

impl<C: MessageChannel> Session<C> {
    pub fn new(
        channel: C,
        options: SessionOptions,
        verifier: Arc<dyn IdentityVerifier>,
        registry: Arc<SessionRegistry>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::channel(options.outbox_capacity.max(1));
        Self {
            id: generate_session_id(),
            channel,
            state: SessionState::AwaitingChallenge,
            identity: None,
            options,
            verifier,
            registry,
            outbox_tx: Some(outbox_tx),
            outbox_rx,
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion.
    pub async fn run(mut self) -> CloseReason {
        debug!(session_id = %self.id, "session started");

        let reason = match self.drive().await {
            Ok(()) => CloseReason::ClientClosed,
            Err(reason) => reason,
        };
        self.state = SessionState::Closed;
        self.registry.unregister(&self.id).await;

        if self.options.error_envelopes {
            if let Some(text) = reason.diagnostic() {
                if let Err(e) = self.write(&Envelope::error(text)).await {
                    debug!(session_id = %self.id, error = %e, "error envelope write failed");
                }
            }
        }
        if let Err(e) = self.channel.close().await {
            debug!(session_id = %self.id, error = %e, "channel close failed");
        }

        let user_id = self.identity.as_ref().map(|(user, _)| user.as_str()).unwrap_or("-");
        match &reason {
            CloseReason::ClientClosed | CloseReason::Shutdown => {
                info!(session_id = %self.id, user_id = %user_id, reason = %reason, "session closed")
            }
            _ => warn!(session_id = %self.id, user_id = %user_id, reason = %reason, "session closed"),
        }
        reason
    }

    async fn drive(&mut self) -> Result<(), CloseReason> {
        self.send_challenge().await?;
        self.authenticate().await?;
        self.relay_loop().await
    }

    async fn send_challenge(&mut self) -> Result<(), CloseReason> {
        let challenge = Envelope::challenge(self.options.challenge.clone());
        self.write(&challenge).await?;
        self.state = SessionState::ChallengeSent;
        Ok(())
    }

    /// Wait for the client's `authenticate`, verify it, and register.
    ///
    /// The verifier call suspends this session only; other sessions run on
    /// their own tasks.
    async fn authenticate(&mut self) -> Result<(), CloseReason> {
        let frame = tokio::select! {
            frame = self.channel.recv() => frame,
            _ = tokio::time::sleep(self.options.auth_timeout) => return Err(CloseReason::AuthTimeout),
            _ = self.shutdown.recv() => return Err(CloseReason::Shutdown),
        };
        let bytes = inbound(frame)?;

        let envelope = decode(&bytes)?;
        if envelope.msg_type != MsgType::Authenticate {
            return Err(CloseReason::ProtocolViolation(format!(
                "expected authenticate, got {}",
                envelope.msg_type
            )));
        }
        let input = AuthenticationInput::parse(&envelope.data)?;

        let profile = self
            .verifier
            .verify(&input.bearer, &input.user_uuid)
            .await
            .map_err(GateError::from)?;

        self.state = SessionState::Authenticated;
        if let Some(outbox) = self.outbox_tx.take() {
            self.registry.register(&self.id, &input.user_uuid, outbox).await;
        }
        self.write(&Envelope::authenticated(profile.clone())).await?;
        info!(session_id = %self.id, user_id = %input.user_uuid, "session authenticated");
        self.identity = Some((input.user_uuid, profile));
        Ok(())
    }

    /// Steady state: relay client messages, deliver registry messages.
    async fn relay_loop(&mut self) -> Result<(), CloseReason> {
        loop {
            tokio::select! {
                frame = self.channel.recv() => {
                    let bytes = inbound(frame)?;
                    let envelope = decode(&bytes)?;
                    if envelope.msg_type == MsgType::Unrecognized {
                        debug!(session_id = %self.id, "relaying unrecognized tag as chat");
                    }
                    self.relay(envelope.as_chat()).await?;
                }
                delivery = self.outbox_rx.recv() => match delivery {
                    Some(envelope) => self.write(&envelope).await?,
                    None => return Err(CloseReason::Shutdown),
                },
                _ = self.shutdown.recv() => return Err(CloseReason::Shutdown),
            }
        }
    }

    async fn relay(&mut self, chat: Envelope) -> Result<(), CloseReason> {
        match self.options.relay {
            RelayPolicy::Echo => self.write(&chat).await,
            RelayPolicy::Others => {
                self.registry.broadcast_except(&self.id, &chat).await;
                Ok(())
            }
            RelayPolicy::All => {
                self.registry.broadcast(&chat).await;
                Ok(())
            }
        }
    }

    async fn write(&mut self, envelope: &Envelope) -> Result<(), CloseReason> {
        let text = encode(envelope).map_err(|e| CloseReason::Transport(e.to_string()))?;
        self.channel
            .send(text.as_bytes())
            .await
            .map_err(|e| CloseReason::Transport(e.to_string()))
    }
}

/// Unwrap a channel read: `None` is an orderly client close.
fn inbound(frame: chatgate_core::GateResult<Option<Vec<u8>>>) -> Result<Vec<u8>, CloseReason> {
    match frame {
        Ok(Some(bytes)) => Ok(bytes),
        Ok(None) => Err(CloseReason::ClientClosed),
        Err(e) => Err(CloseReason::Transport(e.to_string())),
    }
}

/// Generate a random session ID.
fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
