//! Per-websocket client handlers.

use tokio::sync::mpsc;
use tracing::{debug, warn};
use viewsync_client::{Downstream, ErrorBody};
use viewsync_data::{ClientId, CvrVersion};
use viewsync_errors::{SyncError, SyncResult};

/// Frames buffered per client before a slow consumer is failed.
pub const DOWNSTREAM_BUFFER: usize = 1024;

/// The output state machine of one websocket: an ordered, bounded stream of
/// downstream frames, failed as a whole on any error.
#[derive(Debug)]
pub struct ClientHandler {
    client_id: ClientId,
    ws_id: String,
    /// The CVR version the client is known to be at; `None` for a client
    /// with no base cookie (a brand-new client view).
    version: Option<CvrVersion>,
    sender: mpsc::Sender<SyncResult<Downstream>>,
    failed: bool,
}

impl ClientHandler {
    /// Create a handler and the receiving half handed to the transport.
    pub fn new(
        client_id: ClientId,
        ws_id: impl Into<String>,
        base_cookie: Option<CvrVersion>,
    ) -> (Self, mpsc::Receiver<SyncResult<Downstream>>) {
        let (sender, receiver) = mpsc::channel(DOWNSTREAM_BUFFER);
        (
            ClientHandler {
                client_id,
                ws_id: ws_id.into(),
                version: base_cookie,
                sender,
                failed: false,
            },
            receiver,
        )
    }

    /// The client id.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The websocket id distinguishing concurrent sockets of one client.
    pub fn ws_id(&self) -> &str {
        &self.ws_id
    }

    /// The CVR version this client is at.
    pub fn version(&self) -> Option<&CvrVersion> {
        self.version.as_ref()
    }

    /// Record that the client committed a poke to `version`.
    pub fn set_version(&mut self, version: CvrVersion) {
        self.version = Some(version);
    }

    /// True once the subscription has failed; no further frames are sent.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Queue a frame. A full buffer means the consumer cannot keep up; the
    /// subscription is failed rather than blocking the view syncer.
    pub fn send(&mut self, frame: Downstream) {
        if self.failed {
            return;
        }
        match self.sender.try_send(Ok(frame)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client = %self.client_id, ws = %self.ws_id, "downstream buffer full");
                self.fail(SyncError::Internal("downstream buffer overflow".into()));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(client = %self.client_id, ws = %self.ws_id, "downstream closed");
                self.failed = true;
            }
        }
    }

    /// Fail the subscription with a typed error. The error frame is followed
    /// by the terminal `Err`, after which the stream ends.
    pub fn fail(&mut self, err: SyncError) {
        if self.failed {
            return;
        }
        self.failed = true;
        let body = ErrorBody::from(&err);
        let _ = self.sender.try_send(Ok(Downstream::Error(body)));
        let _ = self.sender.try_send(Err(err));
    }
}

#[cfg(test)]
mod tests {
    use viewsync_client::{PokeEnd, PokeStart};

    use super::*;

    fn poke_start(id: &str) -> Downstream {
        Downstream::PokeStart(PokeStart {
            poke_id: id.into(),
            base_cookie: None,
            cookie: "01".into(),
            schema_versions: None,
        })
    }

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (mut handler, mut rx) = ClientHandler::new("c1".into(), "ws1", None);
        handler.send(poke_start("p1"));
        handler.send(Downstream::PokeEnd(PokeEnd {
            poke_id: "p1".into(),
            cookie: Some("01".into()),
            cancel: false,
        }));
        assert!(matches!(
            rx.recv().await.unwrap().unwrap(),
            Downstream::PokeStart(_)
        ));
        assert!(matches!(
            rx.recv().await.unwrap().unwrap(),
            Downstream::PokeEnd(_)
        ));
    }

    #[tokio::test]
    async fn fail_terminates_with_error_frame_then_err() {
        let (mut handler, mut rx) = ClientHandler::new("c1".into(), "ws1", None);
        handler.fail(SyncError::ClientNotFound("g1".into()));
        let frame = rx.recv().await.unwrap().unwrap();
        assert!(matches!(frame, Downstream::Error(_)));
        assert!(rx.recv().await.unwrap().is_err());
        // Frames after failure are dropped.
        handler.send(poke_start("p2"));
        assert!(rx.try_recv().is_err());
    }
}
