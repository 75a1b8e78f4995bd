use crate::error::LifecycleError;
use crate::install::InstallExtensionResult;
use chrono::{DateTime, Utc};
use extman_core::types::{ExtensionIdentifier, InstallSource, LocalExtension, ProfileLocation};
use serde::Serialize;
use tokio::sync::broadcast;

/// Buffered events per subscriber before the slowest one starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Extension lifecycle events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// An install was admitted and is about to run
    WillInstall {
        identifier: ExtensionIdentifier,
        profile_location: ProfileLocation,
        source: InstallSource,
    },

    /// An install batch settled
    DidInstall { results: Vec<InstallExtensionResult> },

    /// An uninstall was admitted and is about to run
    WillUninstall {
        identifier: ExtensionIdentifier,
        profile_location: ProfileLocation,
        application_scoped: bool,
    },

    /// An uninstall settled
    DidUninstall {
        identifier: ExtensionIdentifier,
        profile_location: ProfileLocation,
        application_scoped: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<LifecycleError>,
    },

    /// Installed metadata changed outside of an install
    MetadataUpdated {
        extension: LocalExtension,
        profile_location: ProfileLocation,
    },
}

/// Event metadata envelope
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Unique event ID (UUID v4)
    pub event_id: String,

    /// Event timestamp (UTC)
    pub timestamp: DateTime<Utc>,

    /// Library version that published event
    pub version: String,

    /// The actual event payload
    pub event: LifecycleEvent,
}

impl EventEnvelope {
    pub fn new(event: LifecycleEvent) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            event,
        }
    }
}

/// Typed publish/subscribe channel for lifecycle events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: LifecycleEvent) {
        let _ = self.sender.send(EventEnvelope::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
