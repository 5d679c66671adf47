//! Client-facing session.
//!
//! Speaks the MySQL wire protocol to the client, feeds statements into the
//! router session and pumps backend replies back out. Everything within one
//! session runs on one task; state machines mutate without locking.

mod state;

pub use state::{SessionState, TrxTracker};

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::classifier::{Classify, ClassifierAdapter};
use crate::config::Config;
use crate::hint::parse_hints;
use crate::monitor::ServerRegistry;
use crate::protocol::{
    capabilities, Command, ErrPacket, InitialHandshake, OkPacket, Packet, PacketCodec,
};
use crate::router::{ClientRequest, RouteOutcome, RouterSession};

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("No backend server available")]
    NoBackends,

    #[error("Routing failed: {0}")]
    Routing(String),
}

/// One client connection
pub struct Session {
    id: u32,
    state: SessionState,
    trx: TrxTracker,
    classifier: ClassifierAdapter<Box<dyn Classify>>,
    router_classifier: Option<Box<dyn Classify>>,
    registry: Arc<ServerRegistry>,
    config: Arc<Config>,
}

impl Session {
    pub fn new(
        id: u32,
        config: Arc<Config>,
        registry: Arc<ServerRegistry>,
        classifier: Arc<dyn Classify>,
    ) -> Self {
        Self {
            id,
            state: SessionState::new(),
            trx: TrxTracker::new(),
            classifier: ClassifierAdapter::new(Box::new(classifier.clone())),
            router_classifier: Some(Box::new(classifier)),
            registry,
            config,
        }
    }

    /// Run the session until the client goes away or routing fails fatally
    pub async fn run<S>(mut self, client_stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = Framed::new(client_stream, PacketCodec);

        // handshake
        let handshake = InitialHandshake::new(self.id);
        client.send(handshake.encode()).await?;

        let response_packet = client
            .next()
            .await
            .ok_or(SessionError::ClientDisconnected)??;

        let response = crate::protocol::HandshakeResponse::parse(&response_packet.payload)
            .ok_or_else(|| SessionError::Protocol("Invalid handshake response".into()))?;

        debug!(
            session_id = self.id,
            username = %response.username,
            database = ?response.database,
            "Received handshake response"
        );

        self.state.set_from_handshake(
            response.username.clone(),
            response.database.clone(),
            response.capability_flags & capabilities::DEFAULT_CAPABILITIES,
            response.character_set,
        );

        // open the per-session backend set
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut failover_rx = self.registry.subscribe_failover();

        let classifier = self
            .router_classifier
            .take()
            .ok_or_else(|| SessionError::Protocol("Session already ran".into()))?;

        let mut router = RouterSession::open(
            self.id,
            self.config.router.clone(),
            classifier,
            &self.registry,
            &self.config.backends,
            events_tx.clone(),
        )
        .await;
        router.set_client_capabilities(self.state.capability_flags);

        if !router.has_open_backends() {
            let err = ErrPacket::new(1040, "08004", "No backend server available");
            client.send(err.encode(2, self.state.capability_flags)).await?;
            router.close();
            return Err(SessionError::NoBackends);
        }

        client
            .send(OkPacket::new().encode(2, self.state.capability_flags))
            .await?;

        info!(session_id = self.id, username = %self.state.username, "Client authenticated");

        let result = self
            .command_loop(&mut client, &mut router, &mut events_rx, &mut failover_rx, &events_tx)
            .await;

        router.close();
        result
    }

    async fn command_loop<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        router: &mut RouterSession,
        events_rx: &mut mpsc::UnboundedReceiver<crate::backend::BackendEvent>,
        failover_rx: &mut tokio::sync::watch::Receiver<u64>,
        events_tx: &mpsc::UnboundedSender<crate::backend::BackendEvent>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                maybe_packet = client.next() => {
                    let packet = match maybe_packet {
                        Some(Ok(p)) => p,
                        Some(Err(e)) => {
                            warn!(session_id = self.id, error = %e, "Client read error");
                            return Err(e.into());
                        }
                        None => {
                            info!(session_id = self.id, "Client disconnected");
                            return Ok(());
                        }
                    };

                    if packet.command() == Some(Command::Quit) {
                        info!(session_id = self.id, "Client sent QUIT");
                        return Ok(());
                    }

                    self.handle_client_packet(client, router, packet).await?;
                }

                event = events_rx.recv() => {
                    let Some((backend_id, maybe_packet)) = event else {
                        return Err(SessionError::Protocol("Backend event channel closed".into()));
                    };

                    let packets = match maybe_packet {
                        Some(packet) => router.process_reply(backend_id, packet),
                        None => router.handle_backend_gone(backend_id, self.trx.view()),
                    };

                    if let Some(flags) = router.take_reply_status() {
                        self.trx.observe_server_status(flags);
                    }
                    for packet in packets {
                        client.send(packet).await?;
                    }

                    if let Some(message) = router.failure() {
                        let message = message.to_string();
                        let err = ErrPacket::new(1927, "HY000", &message);
                        let _ = client.send(err.encode(1, self.state.capability_flags)).await;
                        return Err(SessionError::Routing(message));
                    }
                }

                changed = failover_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }

                    let packets = router.handle_failover();
                    for packet in packets {
                        client.send(packet).await?;
                    }

                    if let Some(message) = router.failure() {
                        let message = message.to_string();
                        let err = ErrPacket::new(1927, "HY000", &message);
                        let _ = client.send(err.encode(1, self.state.capability_flags)).await;
                        return Err(SessionError::Routing(message));
                    }

                    // recovered servers may rejoin the session
                    for (idx, backend_config) in self.config.backends.iter().enumerate() {
                        let id = crate::backend::BackendId(idx);
                        if !router.backend(id).in_use()
                            && router.backend(id).server().is_usable()
                        {
                            router.reopen_backend(id, backend_config, events_tx.clone()).await;
                        }
                    }
                }
            }
        }
    }

    /// Route one client packet
    async fn handle_client_packet<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        router: &mut RouterSession,
        packet: Packet,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let hints = if packet.command() == Some(Command::Query) {
            parse_hints(&packet.payload)
        } else {
            Vec::new()
        };

        let classification = self.classifier.classify(&packet.payload);
        self.trx.track_statement(classification.qtype);

        let request = ClientRequest::with_hints(packet, hints);

        match router.route_stmt(&request, self.trx.view()) {
            RouteOutcome::Forwarded => Ok(()),
            RouteOutcome::Reply(packets) => {
                for packet in packets {
                    client.send(packet).await?;
                }
                Ok(())
            }
            RouteOutcome::Fail(message) => {
                warn!(
                    session_id = self.id,
                    user = %self.state.username,
                    "{message}. Closing client connection."
                );
                let err = ErrPacket::new(1927, "HY000", &message);
                let _ = client.send(err.encode(1, self.state.capability_flags)).await;
                Err(SessionError::Routing(message))
            }
        }
    }
}
