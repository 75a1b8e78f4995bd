//! Common test utilities for extman-lifecycle
//!
//! This module provides shared test infrastructure including:
//! - Manifest and extension builders for creating test fixtures
//! - In-memory collaborators (catalog, installer, profiles, participants)
//! - Service wiring and polling helpers

#![allow(dead_code)]
#![allow(unused_imports)]

pub mod builders;
pub mod mocks;

pub use builders::*;
pub use mocks::*;

use extman_core::types::ProfileLocation;
use extman_core::ManagementConfig;
use extman_lifecycle::{EventEnvelope, ExtensionManagementService, LifecycleEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const DEFAULT_PROFILE: &str = "default";
pub const WORK_PROFILE: &str = "work";

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn default_profile() -> ProfileLocation {
    ProfileLocation::new(DEFAULT_PROFILE)
}

pub fn work_profile() -> ProfileLocation {
    ProfileLocation::new(WORK_PROFILE)
}

/// A service wired to fresh in-memory collaborators
pub struct Harness {
    pub catalog: Arc<FakeCatalog>,
    pub installer: Arc<FakeInstaller>,
    pub profiles: Arc<FakeProfiles>,
    pub participant: Arc<RecordingParticipant>,
    pub service: Arc<ExtensionManagementService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ManagementConfig::default())
    }

    pub fn with_config(config: ManagementConfig) -> Self {
        let catalog = Arc::new(FakeCatalog::new());
        let installer = Arc::new(FakeInstaller::new());
        let profiles = Arc::new(FakeProfiles::new(&[DEFAULT_PROFILE, WORK_PROFILE]));
        let participant = Arc::new(RecordingParticipant::new());
        let service = ExtensionManagementService::builder(catalog.clone(), installer.clone())
            .config(config)
            .profiles(profiles.clone())
            .participant(participant.clone())
            .build()
            .expect("default configuration is valid");

        Self {
            catalog,
            installer,
            profiles,
            participant,
            service: Arc::new(service),
        }
    }
}

/// Poll `condition` until it holds or [`TEST_TIMEOUT`] elapses
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Every event already delivered to `rx`
pub fn drain_events(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope.event);
    }
    events
}
