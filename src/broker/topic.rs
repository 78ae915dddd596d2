use tokio::sync::broadcast;

use crate::broker::message::Message;

/// Represents a notification channel in the broker
/// Holds the broadcast sender every subscriber of the channel listens on
/// A subscriber only sees messages published after it subscribed; nothing is
/// retained for late joiners.
#[derive(Debug)]
pub struct Topic {
    pub name: String,
    sender: broadcast::Sender<Message>,
}

impl Topic {
    /// Creates a new instance of the Topic with the given name
    pub fn new(name: &str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.to_string(),
            sender,
        }
    }

    /// Subscribes a new listener to the topic
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.sender.subscribe()
    }

    /// Sends the message to every current listener
    /// Returns the number of listeners reached, zero when nobody listens
    pub fn publish(&self, msg: Message) -> usize {
        self.sender.send(msg).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
