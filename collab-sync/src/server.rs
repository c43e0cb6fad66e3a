//! WebSocket gateway in front of the sync service.
//!
//! Architecture:
//! ```text
//! Client A ──┐   ws://host/?document=doc-1&token=…
//!            ├── SyncServer ── handle_connection (one task per socket)
//! Client B ──┘                     │
//!                                  ├── SyncService::handle_connect / _message / _disconnect
//!                                  │
//!                                  └── ChannelTransport queue ──► socket (fan-out from peers)
//! ```
//!
//! The handshake carries the document id in the `document` query parameter
//! and the credential either in `token` or in an `Authorization: Bearer`
//! header. A rejected connect is answered with a close frame whose code is
//! `4000 + status` (4401, 4403, 4500). Per-frame failures are reported with
//! an ERROR frame and the socket stays open, except for 404 (the session is
//! gone), which closes it. Frames above `max_frame_bytes` are refused by the
//! WebSocket layer itself and end the socket. A connection whose outbound
//! queue overflowed is closed with 1013 (try again) so the client reconnects
//! and re-syncs.
//!
//! Reference: RFC 6455, Section 7.4: Status Codes

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::EventStatus;
use crate::protocol::Envelope;
use crate::router::{ConnectionPhase, MessageOutcome};
use crate::service::SyncService;

type GatewayResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Connect parameters pulled from the upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectRequest {
    pub document_id: Option<String>,
    pub credential: Option<String>,
}

impl ConnectRequest {
    /// Parse the query string and `Authorization` header of an upgrade.
    ///
    /// A bearer header wins over a `token` query parameter.
    pub fn from_parts(query: Option<&str>, authorization: Option<&str>) -> Self {
        let mut request = ConnectRequest::default();
        if let Some(query) = query {
            for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
                match name.as_ref() {
                    "document" => request.document_id = Some(value.into_owned()),
                    "token" => request.credential = Some(value.into_owned()),
                    _ => {}
                }
            }
        }
        if let Some(token) = authorization
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            request.credential = Some(token.to_string());
        }
        request
    }

    fn from_request(req: &Request) -> Self {
        let authorization = req
            .headers()
            .get("authorization")
            .and_then(|value| value.to_str().ok());
        Self::from_parts(req.uri().query(), authorization)
    }
}

/// Close code for a rejected connect.
pub fn close_code_for(status: EventStatus) -> u16 {
    4000 + status.code()
}

/// Close reasons must fit a control frame (125 bytes minus the code).
fn close_reason(reason: &str) -> String {
    const MAX: usize = 123;
    if reason.len() <= MAX {
        return reason.to_string();
    }
    let mut end = MAX;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// The WebSocket server.
pub struct SyncServer {
    service: Arc<SyncService>,
}

impl SyncServer {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<SyncService> {
        &self.service
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.service.config().bind_addr
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> GatewayResult<()> {
        let listener = TcpListener::bind(self.bind_addr()).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> GatewayResult<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let service = self.service.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, service).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<SyncService>,
    ) -> GatewayResult<()> {
        let mut request = ConnectRequest::default();
        let max_frame = service.config().max_frame_bytes;
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(max_frame))
            .max_frame_size(Some(max_frame));
        let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                request = ConnectRequest::from_request(req);
                Ok(resp)
            },
            Some(ws_config),
        )
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let connection_id = Uuid::new_v4();
        let mut phase = ConnectionPhase::Connecting;
        let document_id = request.document_id.unwrap_or_default();

        // Open the outbound queue first so nothing fanned out right after
        // registration is missed.
        let mut outbound = service.transport().open(connection_id).await;

        let connected = match service
            .handle_connect(connection_id, request.credential.as_deref(), &document_id)
            .await
        {
            Ok(connected) => connected,
            Err(e) => {
                service.transport().close(connection_id).await;
                let status = e.status();
                log::info!("Refusing {addr}: {e}");
                ws_sender
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::from(close_code_for(status)),
                        reason: close_reason(&e.to_string()).into(),
                    })))
                    .await?;
                return Ok(());
            }
        };
        phase = phase.transition(ConnectionPhase::Authenticated)?;
        phase = phase.transition(ConnectionPhase::Active)?;
        log::info!(
            "WebSocket {addr} active on {} as {connection_id}",
            connected.session.document_key()
        );

        let result = Self::pump(
            &service,
            connection_id,
            phase,
            connected.snapshot,
            &mut ws_sender,
            &mut ws_receiver,
            &mut outbound,
        )
        .await;

        // Cleanup runs whatever ended the loop.
        service.transport().close(connection_id).await;
        service.handle_disconnect(connection_id).await;
        log::info!("Connection closed from {addr}");
        result
    }

    /// Shuttle frames until either side goes away.
    async fn pump<S, R>(
        service: &SyncService,
        connection_id: Uuid,
        mut phase: ConnectionPhase,
        snapshot: Vec<Vec<u8>>,
        ws_sender: &mut S,
        ws_receiver: &mut R,
        outbound: &mut tokio::sync::mpsc::Receiver<Arc<Vec<u8>>>,
    ) -> GatewayResult<()>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        for frame in snapshot {
            ws_sender.send(Message::Binary(frame.into())).await?;
        }

        while phase.accepts_messages() {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            match service.handle_message(connection_id, &data).await {
                                Ok(MessageOutcome::Reply(reply)) => {
                                    ws_sender.send(Message::Binary(reply.into())).await?;
                                }
                                Ok(MessageOutcome::Ignored { tag }) => {
                                    let frame = Envelope::error(
                                        EventStatus::BadRequest.code(),
                                        format!("unknown message tag {tag}"),
                                    );
                                    ws_sender.send(Message::Binary(frame.encode().into())).await?;
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    let status = e.status();
                                    let frame = Envelope::error(status.code(), e.to_string());
                                    ws_sender.send(Message::Binary(frame.encode().into())).await?;
                                    if status == EventStatus::NotFound {
                                        phase = phase.transition(ConnectionPhase::Closed)?;
                                    }
                                }
                            }
                        }

                        Some(Ok(Message::Text(_))) => {
                            let frame = Envelope::error(
                                EventStatus::BadRequest.code(),
                                "binary frames only",
                            );
                            ws_sender.send(Message::Binary(frame.encode().into())).await?;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            phase = phase.transition(ConnectionPhase::Closed)?;
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error on {connection_id}: {e}");
                            phase = phase.transition(ConnectionPhase::Closed)?;
                        }

                        Some(Ok(_)) => {}
                    }
                }

                // Outgoing fan-out frame
                frame = outbound.recv() => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                        }
                        None => {
                            // Closed by fan-out (queue overflow) or by the expiry sweep.
                            log::info!("Outbound queue of {connection_id} closed; asking client to re-sync");
                            ws_sender
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Again,
                                    reason: "session ended; reconnect to re-sync".into(),
                                })))
                                .await?;
                            phase = phase.transition(ConnectionPhase::Closed)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessValidator, StaticAuthorizer, StaticIdentityService};
    use crate::config::ServerConfig;

    #[test]
    fn test_connect_request_from_query() {
        let request = ConnectRequest::from_parts(Some("document=doc-1&token=abc%20def"), None);
        assert_eq!(request.document_id.as_deref(), Some("doc-1"));
        assert_eq!(request.credential.as_deref(), Some("abc def"));
    }

    #[test]
    fn test_bearer_header_wins() {
        let request =
            ConnectRequest::from_parts(Some("document=doc-1&token=query"), Some("Bearer header"));
        assert_eq!(request.credential.as_deref(), Some("header"));
    }

    #[test]
    fn test_missing_parts() {
        assert_eq!(ConnectRequest::from_parts(None, None), ConnectRequest::default());
        let request = ConnectRequest::from_parts(Some("other=1"), Some("Basic abc"));
        assert_eq!(request, ConnectRequest::default());
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(close_code_for(EventStatus::Unauthorized), 4401);
        assert_eq!(close_code_for(EventStatus::Forbidden), 4403);
        assert_eq!(close_code_for(EventStatus::Internal), 4500);
    }

    #[test]
    fn test_close_reason_fits_control_frame() {
        assert_eq!(close_reason("denied"), "denied");
        let long = "é".repeat(100);
        let reason = close_reason(&long);
        assert!(reason.len() <= 123);
        assert!(long.starts_with(&reason));
    }

    #[test]
    fn test_server_bind_addr() {
        let validator = AccessValidator::new(
            Arc::new(StaticIdentityService::new()),
            Arc::new(StaticAuthorizer::new()),
        );
        let service = Arc::new(SyncService::in_memory(ServerConfig::default(), validator));
        let server = SyncServer::new(service);
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }
}
