use dashmap::DashMap;
use serde_json::json;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Channel that carries every event of a calendar.
pub const CALENDAR_CHANNEL: &str = "calendar";

/// Per-entity channel name, e.g. `booking_01arz3ndektsv4rrffq69g5fav`.
/// Lowercase, the way an unquoted `LISTEN` spells it.
pub fn entity_channel(event: &Event) -> String {
    let prefix = match event {
        Event::ClientCreated { .. } | Event::ClientDeleted { .. } => "client",
        _ => "booking",
    };
    format!("{prefix}_{}", event.entity_id().to_string().to_lowercase())
}

/// JSON payload delivered to listeners.
pub fn payload(event: &Event) -> String {
    json!({
        "event": event.kind(),
        "id": event.entity_id().to_string(),
    })
    .to_string()
}

/// Broadcast hub for LISTEN/NOTIFY on one calendar.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Event>>,
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

    /// Subscribe to a channel. Creates it if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Event> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish on the calendar channel and on the entity's own channel.
    /// No-op for channels nobody listens on.
    pub fn send(&self, event: &Event) {
        for channel in [CALENDAR_CHANNEL.to_string(), entity_channel(event)] {
            if let Some(sender) = self.channels.get(&channel) {
                let _ = sender.send(event.clone());
            }
        }
    }

    /// Drop channels whose last receiver is gone.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
