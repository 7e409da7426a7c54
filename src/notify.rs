use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// What a subscriber is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every calendar change (reservations, closures, productions, series).
    Calendar,
    /// Ledger and booking changes for one member.
    User(Ulid),
    /// Confirmation reminders handed out by the reminder job.
    Reminders,
}

/// A change-feed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Changed(Event),
    Reminder {
        reservation_id: Ulid,
        user_id: Ulid,
        message: String,
    },
}

/// In-process broadcast hub for change notifications per topic.
pub struct NotifyHub {
    channels: DashMap<Topic, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a topic. Creates the channel if needed.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, topic: Topic, notice: &Notice) {
        if let Some(sender) = self.channels.get(&topic)
            && sender.send(notice.clone()).is_err()
        {
            // last receiver went away
            drop(sender);
            self.channels.remove(&topic);
        }
    }

    /// Fan a committed event out to the calendar feed and, when known, the member's feed.
    pub fn publish(&self, event: &Event, user_id: Option<Ulid>) {
        let notice = Notice::Changed(event.clone());
        self.send(Topic::Calendar, &notice);
        if let Some(user_id) = user_id {
            self.send(Topic::User(user_id), &notice);
        }
    }
}
