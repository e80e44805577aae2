//! Lifecycle notifications for external consumers.

use tokio::sync::{broadcast, watch};

use super::restart::RestartToken;
use crate::protocol::ListeningAddress;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A close began; the listening address is gone until the next `Listening`.
    Closing,
    /// A new worker became ready.
    Listening(ListeningAddress),
    /// The restart callback of a close cycle ran and a new worker was spawned.
    RestartComplete(RestartToken),
    /// A worker process exited, expectedly or not.
    WorkerExited { pid: u32, code: Option<i32> },
}

/// Broadcast channel for events plus the watch channel that carries the
/// current address. Both only change together.
pub(crate) struct EventBus {
    events: broadcast::Sender<SupervisorEvent>,
    address: watch::Sender<Option<ListeningAddress>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        let (address, _) = watch::channel(None);
        Self { events, address }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn address_rx(&self) -> watch::Receiver<Option<ListeningAddress>> {
        self.address.subscribe()
    }

    pub fn address(&self) -> Option<ListeningAddress> {
        self.address.borrow().clone()
    }

    pub fn publish_listening(&self, address: ListeningAddress) {
        self.address.send_replace(Some(address.clone()));
        self.emit(SupervisorEvent::Listening(address));
    }

    pub fn publish_closing(&self) {
        self.address.send_replace(None);
        self.emit(SupervisorEvent::Closing);
    }

    pub fn emit(&self, event: SupervisorEvent) {
        tracing::debug!("Event: {:?}", event);
        // 구독자가 없어도 무시
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_address_follows_events() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let address = bus.address_rx();

        bus.publish_listening(ListeningAddress::new("127.0.0.1", 8080));
        assert_eq!(*address.borrow(), Some(ListeningAddress::new("127.0.0.1", 8080)));
        assert_eq!(
            events.recv().await.unwrap(),
            SupervisorEvent::Listening(ListeningAddress::new("127.0.0.1", 8080))
        );

        bus.publish_closing();
        assert_eq!(bus.address(), None);
        assert_eq!(events.recv().await.unwrap(), SupervisorEvent::Closing);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(SupervisorEvent::Closing);
        bus.publish_closing();
        assert_eq!(bus.address(), None);
    }
}
