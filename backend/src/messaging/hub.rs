use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::Message;

const CHANNEL_CAPACITY: usize = 64;

/// Fan-out of newly stored messages to live conversation streams.
#[derive(Clone, Default)]
pub struct MessageHub {
    channels: Arc<DashMap<Uuid, broadcast::Sender<Message>>>,
}

impl MessageHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channels whose streams have all closed are swept here as well as on
    /// publish, so conversations that are watched but never written to do not
    /// accumulate.
    pub fn subscribe(&self, conversation_id: Uuid) -> broadcast::Receiver<Message> {
        self.prune();
        match self.channels.entry(conversation_id) {
            Entry::Occupied(e) => e.get().subscribe(),
            Entry::Vacant(v) => {
                let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
                v.insert(tx);
                rx
            }
        }
    }

    /// Returns the number of live subscribers reached. Channels nobody listens
    /// to any more are dropped.
    pub fn publish(&self, message: &Message) -> usize {
        let conversation_id = message.conversation_id;
        let delivered = match self.channels.get(&conversation_id) {
            Some(tx) => tx.send(message.clone()).unwrap_or(0),
            None => return 0,
        };
        if delivered == 0 {
            self.channels
                .remove_if(&conversation_id, |_, tx| tx.receiver_count() == 0);
        }
        delivered
    }

    pub fn prune(&self) {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
    }

    pub fn active_conversations(&self) -> usize {
        self.channels.len()
    }
}
