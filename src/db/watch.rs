// In-process publish/subscribe for ticket status transitions.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

/// A ticket's terminal transition, delivered to live watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketTransition {
    Matched { match_id: i64 },
    Cancelled,
    Expired,
}

/// Per-ticket broadcast channels fed by the store mutators.
///
/// Every transition here is terminal, so a channel is torn down on its
/// first publish; a later publish for the same ticket is a no-op. That
/// makes it safe for the engine to republish a transition it merely
/// observed (e.g. another process bound the ticket).
#[derive(Debug, Default)]
pub struct TicketWatch {
    channels: Mutex<HashMap<i64, broadcast::Sender<TicketTransition>>>,
}

impl TicketWatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a ticket's transitions. Must be called before the
    /// transition is published, or the event is missed.
    pub fn subscribe(&self, ticket_id: i64) -> broadcast::Receiver<TicketTransition> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(ticket_id)
            .or_insert_with(|| broadcast::channel(8).0)
            .subscribe()
    }

    /// Deliver a terminal transition to all watchers and tear the channel
    /// down. Publishing with no watchers, or twice, is a no-op.
    pub fn publish(&self, ticket_id: i64, transition: TicketTransition) {
        let sender = self.channels.lock().unwrap().remove(&ticket_id);
        if let Some(sender) = sender {
            let _ = sender.send(transition);
        }
    }
}
