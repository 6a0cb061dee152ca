//! One WebSocket peer as seen by the task engine.
//!
//! The socket itself lives in the HTTP layer; tasks only hold the sending
//! half of an unbounded channel that a writer task drains into the socket.

use jsvault_common::protocol::error::{JsVaultError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Frame queued for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
    open: AtomicBool,
}

impl Connection {
    /// New open connection plus the receiver its writer should drain.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            tx,
            open: AtomicBool::new(true),
        });
        (connection, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        if !self.is_open() {
            return Err(JsVaultError::Transport(format!("connection {} is closed", self.id)));
        }
        self.tx.send(Outbound::Text(text.into())).map_err(|_| {
            self.mark_closed();
            JsVaultError::Transport(format!("connection {} writer is gone", self.id))
        })
    }

    /// Ask the writer to close the socket. Repeated calls are no-ops.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Outbound::Close);
        }
    }

    /// Record that the peer went away without queueing a close frame.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_and_close() {
        let (conn, mut rx) = Connection::new();
        conn.send_text("hello").unwrap();
        conn.close();
        conn.close();

        assert_eq!(rx.try_recv().unwrap(), Outbound::Text("hello".into()));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert!(rx.try_recv().is_err());
        assert!(matches!(conn.send_text("late"), Err(JsVaultError::Transport(_))));
    }

    #[test]
    fn test_dropped_writer_closes_connection() {
        let (conn, rx) = Connection::new();
        drop(rx);
        assert!(!conn.is_open());
        assert!(conn.send_text("x").is_err());
    }
}
