//! Post-auth session dispatcher: reads frames in a loop and routes them by
//! namespace to the connection, heartbeat, or receiver sub-protocol.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use super::auth::{Conn, RECEIVER_ID, SENDER_ID};
use super::interactive::SessionEvent;
use super::payload::{
    AppAvailabilityResponse, Close, GetAppAvailability, Launch, Pong, ReceiverStatus, TypeTag,
    NS_CONNECTION, NS_HEARTBEAT, NS_RECEIVER,
};
use super::wire::{json_message, read_message, write_message};
use crate::error::{CastforgeError, Result};

impl<S> Conn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the post-auth dispatch loop until the peer closes the connection
    /// or a protocol error terminates the session. On exit, if a CONNECT
    /// had been received, emits a CLOSE payload on the connection
    /// namespace first.
    pub async fn run(mut self, conn_index: u64) -> Result<()> {
        let result = self.dispatch_loop(conn_index).await;

        if self.connected {
            let close = serde_json::to_string(&Close::new()).expect("Close always serializes");
            let msg = json_message(RECEIVER_ID, SENDER_ID, NS_CONNECTION, &close);
            // Best-effort: the peer may already be gone.
            let _ = write_message(&mut self.stream, &msg).await;
        }

        result
    }

    async fn dispatch_loop(&mut self, conn_index: u64) -> Result<()> {
        loop {
            let envelope = match read_message(&mut self.stream).await {
                Ok(envelope) => envelope,
                Err(CastforgeError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    info!(conn_index, "peer closed connection");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let namespace = envelope.namespace.clone();
            let Some(json) = envelope.payload_utf8.as_deref() else {
                warn!(conn_index, namespace, "ignoring non-JSON message");
                continue;
            };

            let reply = match namespace.as_str() {
                NS_HEARTBEAT => self.handle_heartbeat(json)?,
                NS_CONNECTION => self.handle_connection(json)?,
                NS_RECEIVER => self.handle_receiver(json, conn_index)?,
                other => {
                    info!(conn_index, namespace = other, "ignoring unknown namespace");
                    None
                }
            };

            if let Some(reply_json) = reply {
                let msg = json_message(RECEIVER_ID, SENDER_ID, &namespace, &reply_json);
                write_message(&mut self.stream, &msg).await?;
            }
        }
    }

    fn handle_heartbeat(&mut self, json: &str) -> Result<Option<String>> {
        let tag: TypeTag = serde_json::from_str(json)
            .map_err(|e| CastforgeError::Format(format!("malformed heartbeat payload: {e}")))?;

        if tag.type_ != "PING" {
            return Err(CastforgeError::Protocol(format!(
                "unexpected heartbeat message type {}",
                tag.type_
            )));
        }

        Ok(Some(
            serde_json::to_string(&Pong::new()).expect("Pong always serializes"),
        ))
    }

    fn handle_connection(&mut self, json: &str) -> Result<Option<String>> {
        let tag: TypeTag = serde_json::from_str(json)
            .map_err(|e| CastforgeError::Format(format!("malformed connection payload: {e}")))?;

        match tag.type_.as_str() {
            "CONNECT" => {
                if self.connected {
                    return Err(CastforgeError::Protocol("CONNECT after connect".to_string()));
                }
                self.connected = true;
                Ok(None)
            }
            other => Err(CastforgeError::Protocol(format!(
                "unexpected connection message type {other}"
            ))),
        }
    }

    fn handle_receiver(&mut self, json: &str, conn_index: u64) -> Result<Option<String>> {
        let tag: TypeTag = serde_json::from_str(json)
            .map_err(|e| CastforgeError::Format(format!("malformed receiver payload: {e}")))?;

        match tag.type_.as_str() {
            "GET_APP_AVAILABILITY" => {
                let req: GetAppAvailability = serde_json::from_str(json)
                    .map_err(|e| CastforgeError::Format(format!("malformed GET_APP_AVAILABILITY: {e}")))?;
                let resp = AppAvailabilityResponse::for_apps(req.request_id, &req.app_id);
                Ok(Some(serde_json::to_string(&resp).expect("always serializes")))
            }
            "GET_STATUS" => {
                let resp = ReceiverStatus::canned(tag.request_id, None);
                Ok(Some(serde_json::to_string(&resp).expect("always serializes")))
            }
            "LAUNCH" => {
                let req: Launch = serde_json::from_str(json)
                    .map_err(|e| CastforgeError::Format(format!("malformed LAUNCH: {e}")))?;
                let resp = ReceiverStatus::canned(req.request_id, req.app_id.as_deref());
                if let Some(sink) = &self.events {
                    let app_id = req.app_id.unwrap_or_else(|| super::payload::DEFAULT_APP_ID.to_string());
                    sink.emit(SessionEvent::AppLaunched { conn_index, app_id });
                }
                Ok(Some(serde_json::to_string(&resp).expect("always serializes")))
            }
            other => {
                warn!(message_type = other, "ignoring unhandled receiver message");
                Ok(None)
            }
        }
    }
}
