//! Event hub: typed bidirectional messaging with every participant
//!
//! Each attached participant owns exactly one bounded outbound FIFO. A
//! participant that cannot drain its queue past the configured backlog is
//! closed (backpressure by disconnection); a fresh session re-syncs state on
//! reconnect. Fan-out helpers address participants by role, so ordering is
//! preserved per (source, destination) pair but never across participants.

pub mod coalesce;
pub mod dispatch;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::messages::ServerMessage;
use crate::registry::types::{ClientId, TransportId};

/// Role a participant is bound to; set by its first registration message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantRole {
    /// Attached but not yet registered.
    Unbound,
    Broadcaster,
    Viewer(ClientId),
    Admin,
}

struct Participant {
    role: ParticipantRole,
    tx: mpsc::Sender<ServerMessage>,
}

/// The hub's participant table and egress paths
pub struct EventHub {
    participants: RwLock<HashMap<TransportId, Participant>>,
    outbound_capacity: usize,
}

impl EventHub {
    pub fn new(outbound_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            participants: RwLock::new(HashMap::new()),
            outbound_capacity,
        })
    }

    /// Attach a new participant. Returns its transport id and the receiving
    /// end of its outbound FIFO; the transport task forwards messages from
    /// the receiver to the socket and treats channel closure as an order to
    /// hang up.
    pub fn attach(&self) -> (TransportId, mpsc::Receiver<ServerMessage>) {
        let transport_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        self.participants.write().insert(
            transport_id.clone(),
            Participant {
                role: ParticipantRole::Unbound,
                tx,
            },
        );
        debug!(transport_id = %transport_id, "Participant attached");
        (transport_id, rx)
    }

    /// Remove a participant. Dropping its sender closes the outbound channel,
    /// which the transport task observes as a hang-up order. Idempotent.
    pub fn detach(&self, transport_id: &str) {
        if self.participants.write().remove(transport_id).is_some() {
            debug!(transport_id = %transport_id, "Participant detached");
        }
    }

    /// Forcibly close a participant's transport.
    pub fn close(&self, transport_id: &str) {
        self.detach(transport_id);
    }

    /// Bind a participant to its role once its registration message arrives.
    pub fn bind_role(&self, transport_id: &str, role: ParticipantRole) {
        if let Some(participant) = self.participants.write().get_mut(transport_id) {
            participant.role = role;
        }
    }

    pub fn role(&self, transport_id: &str) -> Option<ParticipantRole> {
        self.participants
            .read()
            .get(transport_id)
            .map(|p| p.role.clone())
    }

    pub fn is_attached(&self, transport_id: &str) -> bool {
        self.participants.read().contains_key(transport_id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.read().len()
    }

    /// Send to one transport. Returns false when the participant is absent
    /// or was closed for falling behind.
    pub fn send_to(&self, transport_id: &str, message: ServerMessage) -> bool {
        let tx = match self.participants.read().get(transport_id) {
            Some(participant) => participant.tx.clone(),
            None => return false,
        };

        match tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    transport_id = %transport_id,
                    backlog = self.outbound_capacity,
                    "Participant outbound queue overflowed, closing transport"
                );
                self.close(transport_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.detach(transport_id);
                false
            }
        }
    }

    /// Send to the viewer currently bound to `client_id`, if connected.
    pub fn send_to_viewer(&self, client_id: &str, message: ServerMessage) -> bool {
        let target = self.participants.read().iter().find_map(|(id, p)| {
            matches!(&p.role, ParticipantRole::Viewer(bound) if bound == client_id)
                .then(|| id.clone())
        });
        match target {
            Some(transport_id) => self.send_to(&transport_id, message),
            None => false,
        }
    }

    /// Send to the active broadcaster, if attached.
    pub fn send_to_broadcaster(&self, message: ServerMessage) -> bool {
        let target = self.participants.read().iter().find_map(|(id, p)| {
            matches!(p.role, ParticipantRole::Broadcaster).then(|| id.clone())
        });
        match target {
            Some(transport_id) => self.send_to(&transport_id, message),
            None => false,
        }
    }

    /// Fan out to every admin.
    pub fn broadcast_admins(&self, message: ServerMessage) {
        let targets: Vec<TransportId> = self
            .participants
            .read()
            .iter()
            .filter(|(_, p)| matches!(p.role, ParticipantRole::Admin))
            .map(|(id, _)| id.clone())
            .collect();
        for transport_id in targets {
            self.send_to(&transport_id, message.clone());
        }
    }

    /// Fan out to every viewer and admin (geometry and presence changes).
    pub fn broadcast_watchers(&self, message: ServerMessage) {
        let targets: Vec<TransportId> = self
            .participants
            .read()
            .iter()
            .filter(|(_, p)| {
                matches!(
                    p.role,
                    ParticipantRole::Admin | ParticipantRole::Viewer(_)
                )
            })
            .map(|(id, _)| id.clone())
            .collect();
        for transport_id in targets {
            self.send_to(&transport_id, message.clone());
        }
    }
}
