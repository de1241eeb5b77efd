use crate::database::DomainId;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

/// Change notifications published by the registry and the certificate store.
/// Subscribers rebuild their derived state from scratch on every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    DomainAdded { id: DomainId, domain: String },
    DomainUpdated { id: DomainId, domain: String },
    DomainRemoved { id: DomainId, domain: String },
    ProcessesRefreshed,
    CertificateIssued { domain: String },
    CertificateRemoved { domain: String },
}

/// Fan-out bus shared by the publishers; cheap to clone
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
