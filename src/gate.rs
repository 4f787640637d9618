// Single-flight admission: one stream at a time across all conversations.

use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    Idle,
    /// Admitted, but no assistant message is bound yet.
    Starting,
    Streaming {
        conversation_id: Uuid,
        message_id: Uuid,
    },
}

impl StreamStatus {
    pub fn is_busy(&self) -> bool {
        !matches!(self, StreamStatus::Idle)
    }
}

#[derive(Clone)]
pub struct StreamGate {
    status: Arc<watch::Sender<StreamStatus>>,
}

impl StreamGate {
    pub fn new() -> Self {
        Self {
            status: Arc::new(watch::Sender::new(StreamStatus::Idle)),
        }
    }

    /// Checks and claims the gate in one step. Returns `None` while another
    /// stream holds it.
    pub fn try_acquire(&self) -> Option<StreamPermit> {
        let acquired = self.status.send_if_modified(|status| {
            if status.is_busy() {
                return false;
            }
            *status = StreamStatus::Starting;
            true
        });
        acquired.then(|| StreamPermit {
            status: self.status.clone(),
        })
    }

    pub fn status(&self) -> StreamStatus {
        *self.status.borrow()
    }

    pub fn is_busy(&self) -> bool {
        self.status().is_busy()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamStatus> {
        self.status.subscribe()
    }
}

impl Default for StreamGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof of admission. Dropping it releases the gate, whatever path the
/// generation took.
pub struct StreamPermit {
    status: Arc<watch::Sender<StreamStatus>>,
}

impl StreamPermit {
    /// Records which assistant message the running stream is writing to.
    pub fn bind(&self, conversation_id: Uuid, message_id: Uuid) {
        self.status.send_replace(StreamStatus::Streaming {
            conversation_id,
            message_id,
        });
    }
}

impl Drop for StreamPermit {
    fn drop(&mut self) {
        self.status.send_replace(StreamStatus::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_permit_at_a_time() {
        let gate = StreamGate::new();
        let permit = gate.try_acquire().expect("idle gate admits");
        assert!(gate.is_busy());
        assert!(gate.try_acquire().is_none());

        drop(permit);
        assert_eq!(gate.status(), StreamStatus::Idle);
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn bound_permit_reports_streaming_message() {
        let gate = StreamGate::new();
        let mut rx = gate.subscribe();
        let permit = gate.try_acquire().unwrap();
        assert_eq!(*rx.borrow_and_update(), StreamStatus::Starting);

        let (conversation_id, message_id) = (Uuid::new_v4(), Uuid::new_v4());
        permit.bind(conversation_id, message_id);
        assert_eq!(
            *rx.borrow_and_update(),
            StreamStatus::Streaming {
                conversation_id,
                message_id
            }
        );

        drop(permit);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow(), StreamStatus::Idle);
    }
}
