//! Interactive stdio session-event printing for `serve`.
//!
//! The source tool's server can run "interactively," printing a line per
//! session lifecycle event to stdout so an operator watching a terminal
//! can follow connections as they happen, distinct from the structured
//! `tracing` log stream. This is a thin, line-oriented sink: one print per
//! event, no input is read back despite the name suggesting a REPL in the
//! source -- this rewrite has no interactive commands to dispatch.

use std::io::Write;

use tokio::sync::mpsc;

/// A session lifecycle event worth surfacing to an operator's terminal.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected { conn_index: u64, peer_addr: String },
    Authenticated { conn_index: u64 },
    AppLaunched { conn_index: u64, app_id: String },
    Closed { conn_index: u64, reason: String },
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Connected { conn_index, peer_addr } => {
                write!(f, "[{conn_index}] connection from {peer_addr}")
            }
            SessionEvent::Authenticated { conn_index } => {
                write!(f, "[{conn_index}] device-auth completed")
            }
            SessionEvent::AppLaunched { conn_index, app_id } => {
                write!(f, "[{conn_index}] launched {app_id}")
            }
            SessionEvent::Closed { conn_index, reason } => {
                write!(f, "[{conn_index}] closed: {reason}")
            }
        }
    }
}

/// A channel handle session tasks use to report events to the interactive
/// printer without blocking on stdout themselves.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn emit(&self, event: SessionEvent) {
        // The receiving end only goes away at shutdown; a dropped send is
        // not worth failing a session over.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
pub(crate) fn test_sink(tx: mpsc::UnboundedSender<SessionEvent>) -> EventSink {
    EventSink { tx }
}

/// Spawn the printer task and return a sink for session tasks to report
/// through. The returned join handle resolves once the sink (and every
/// clone of it) has been dropped.
pub fn spawn_printer<W: Write + Send + 'static>(mut out: W) -> (EventSink, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = tokio::task::spawn_blocking(move || {
        while let Some(event) = rx.blocking_recv() {
            let _ = writeln!(out, "{event}");
            let _ = out.flush();
        }
    });

    (EventSink { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_are_printed_in_order() {
        let buffer: Vec<u8> = Vec::new();
        let (sink, handle) = spawn_printer(buffer);

        sink.emit(SessionEvent::Connected { conn_index: 0, peer_addr: "127.0.0.1:1234".to_string() });
        sink.emit(SessionEvent::Authenticated { conn_index: 0 });
        sink.emit(SessionEvent::Closed { conn_index: 0, reason: "peer closed connection".to_string() });
        drop(sink);

        handle.await.unwrap();
    }

    #[test]
    fn display_formats_include_conn_index() {
        let event = SessionEvent::AppLaunched { conn_index: 3, app_id: "CC1AD845".to_string() };
        assert_eq!(event.to_string(), "[3] launched CC1AD845");
    }
}
