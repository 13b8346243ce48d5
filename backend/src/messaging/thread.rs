use std::collections::HashSet;

use uuid::Uuid;

use super::Message;

/// Ordered view of one conversation that ignores rows it has already seen.
/// The stream builds one from the stored backlog and then checks live pushes
/// against its ids only.
#[derive(Debug, Default)]
pub struct MessageThread {
    seen: HashSet<Uuid>,
    messages: Vec<Message>,
}

impl MessageThread {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the message was already present.
    pub fn push(&mut self, message: Message) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        let key = (message.created_at, message.id);
        let at = self
            .messages
            .partition_point(|m| (m.created_at, m.id) <= key);
        self.messages.insert(at, message);
        true
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl MessageThread {
    /// Splits into the ordered messages and the ids they cover.
    pub fn into_parts(self) -> (Vec<Message>, HashSet<Uuid>) {
        (self.messages, self.seen)
    }
}

impl Extend<Message> for MessageThread {
    fn extend<T: IntoIterator<Item = Message>>(&mut self, iter: T) {
        for message in iter {
            self.push(message);
        }
    }
}
