//! Installation lifecycle integration tests
//!
//! Tests the complete install batch including:
//! - Dependency and pack expansion
//! - Metadata carried over on update
//! - Rollback of fresh installs when a batch member fails
//! - Admission checks (policy, malicious, deprecation, compatibility)
//! - Profile routing and lifecycle events

mod common;

use common::*;
use extman_core::types::{
    ArtifactSource, InstallOperation, InstallOptions, InstallSourceKind, ProfileLocation,
};
use extman_core::ManagementConfig;
use extman_lifecycle::{
    ControlList, DeprecationInfo, DeprecationReplacement, ErrorCode, InstallRequest,
    LifecycleEvent, StatisticKind,
};

mod install_lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_install_pulls_in_dependency() {
        let h = Harness::new();
        let a = h
            .catalog
            .publish(ManifestBuilder::new("acme.app").depends_on(&["acme.lib"]).build());
        h.catalog.publish(ManifestBuilder::new("acme.lib").build());
        let mut events = h.service.subscribe();

        let results = h
            .service
            .install_extensions(vec![InstallRequest::catalog(a, InstallOptions::default())])
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_success()));
        let lib = results
            .iter()
            .find(|r| r.identifier.matches_id("acme.lib"))
            .unwrap();
        assert!(lib.is_dependency_or_pack());
        assert_eq!(lib.operation, InstallOperation::Install);

        assert_eq!(
            h.installer.installed_ids(&default_profile()),
            vec!["acme.app", "acme.lib"]
        );
        let mut activated = h.participant.installed();
        activated.sort();
        assert_eq!(activated, vec!["acme.app", "acme.lib"]);

        let events = drain_events(&mut events);
        let will_install = events
            .iter()
            .filter(|e| matches!(e, LifecycleEvent::WillInstall { .. }))
            .count();
        assert_eq!(will_install, 2);
        match events.last() {
            Some(LifecycleEvent::DidInstall { results }) => assert_eq!(results.len(), 2),
            other => panic!("expected DidInstall last, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_install_reports_statistics_for_fresh_installs() {
        let h = Harness::new();
        let a = h.catalog.publish(ManifestBuilder::new("acme.app").build());

        h.service
            .install_from_catalog(a, InstallOptions::default())
            .await
            .unwrap();

        assert_eq!(
            h.catalog.statistics(),
            vec![("acme.app".to_string(), StatisticKind::Install)]
        );
    }

    #[tokio::test]
    async fn test_update_carries_metadata_over() {
        let h = Harness::new();
        let installed = LocalExtensionBuilder::new(ManifestBuilder::new("acme.app").build())
            .pinned()
            .machine_scoped()
            .build();
        h.installer.seed(&default_profile(), installed);
        let update = h
            .catalog
            .publish(ManifestBuilder::new("acme.app").version("2.0.0").build());

        let results = h
            .service
            .install_extensions(vec![InstallRequest::catalog(update, InstallOptions::default())])
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].operation, InstallOperation::Update);
        let local = results[0].local().unwrap();
        assert_eq!(local.version(), "2.0.0");
        assert!(local.metadata.pinned);
        assert!(local.metadata.is_machine_scoped);
        assert!(local.metadata.updated);
        assert_eq!(local.metadata.source, Some(InstallSourceKind::Catalog));

        // Updates are not counted as installs
        assert!(h.catalog.statistics().is_empty());
    }

    #[tokio::test]
    async fn test_update_can_unpin() {
        let h = Harness::new();
        let installed = LocalExtensionBuilder::new(ManifestBuilder::new("acme.app").build())
            .pinned()
            .build();
        h.installer.seed(&default_profile(), installed);
        let update = h
            .catalog
            .publish(ManifestBuilder::new("acme.app").version("2.0.0").build());

        let options = InstallOptions {
            pinned: Some(false),
            ..Default::default()
        };
        let local = h.service.install_from_catalog(update, options).await.unwrap();

        assert_eq!(local.version(), "2.0.0");
        assert!(!local.metadata.pinned);
        assert!(local.metadata.updated);
    }

    #[tokio::test]
    async fn test_reinstall_of_same_version_only_updates_metadata() {
        let h = Harness::new();
        let manifest = ManifestBuilder::new("acme.app").build();
        h.installer.seed(&default_profile(), local(manifest.clone()));
        let entry = h.catalog.publish(manifest);

        let options = InstallOptions {
            pinned: Some(true),
            ..Default::default()
        };
        let local = h
            .service
            .install_from_catalog(entry, options)
            .await
            .unwrap();

        assert!(local.metadata.pinned);
        assert_eq!(
            h.installer.count(|op| matches!(op, InstallerOp::WriteStarted(..))),
            0
        );
        assert_eq!(
            h.installer.count(|op| matches!(op, InstallerOp::MetadataUpdated(..))),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_pack_member_rolls_back_root_and_siblings() {
        let h = Harness::new();
        let pack = h.catalog.publish(
            ManifestBuilder::new("acme.pack")
                .pack(&["acme.one", "acme.two"])
                .build(),
        );
        h.catalog.publish(ManifestBuilder::new("acme.one").build());
        h.catalog.publish(ManifestBuilder::new("acme.two").build());
        h.installer.fail_writes_of("acme.two");

        let results = h
            .service
            .install_extensions(vec![InstallRequest::catalog(pack, InstallOptions::default())])
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.is_success()));

        let root = results
            .iter()
            .find(|r| r.identifier.matches_id("acme.pack"))
            .unwrap();
        assert!(root.error().unwrap().message.contains("acme.two"));

        assert!(h.installer.installed(&default_profile()).is_empty());
        let removed = h
            .installer
            .count(|op| matches!(op, InstallerOp::Removed(..)));
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn test_failed_dependency_keeps_updated_root() {
        let h = Harness::new();
        h.installer.seed(
            &default_profile(),
            local(ManifestBuilder::new("acme.app").build()),
        );
        let update = h.catalog.publish(
            ManifestBuilder::new("acme.app")
                .version("2.0.0")
                .depends_on(&["acme.lib"])
                .build(),
        );
        h.catalog.publish(ManifestBuilder::new("acme.lib").build());
        h.installer.fail_writes_of("acme.lib");

        let results = h
            .service
            .install_extensions(vec![InstallRequest::catalog(update, InstallOptions::default())])
            .await
            .unwrap();

        let root = results
            .iter()
            .find(|r| r.identifier.matches_id("acme.app"))
            .unwrap();
        assert!(!root.is_success());
        assert_eq!(root.operation, InstallOperation::Update);

        // The prior installation is never removed
        assert_eq!(
            h.installer.count(|op| matches!(op, InstallerOp::Removed(..))),
            0
        );
        let app = h.installer.find(&default_profile(), "acme.app").unwrap();
        assert_eq!(app.version(), "2.0.0");
    }

    #[tokio::test]
    async fn test_post_install_failure_rolls_back() {
        let h = Harness::new();
        let a = h.catalog.publish(ManifestBuilder::new("acme.app").build());
        h.participant.fail_post_install_of("acme.app");

        let err = h
            .service
            .install_from_catalog(a, InstallOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::PostInstall);
        assert!(h.installer.installed(&default_profile()).is_empty());
        assert!(h
            .installer
            .position(&InstallerOp::Removed(
                "acme.app".to_string(),
                DEFAULT_PROFILE.to_string()
            ))
            .is_some());
    }

    #[tokio::test]
    async fn test_rollback_is_reported_as_uninstall() {
        let h = Harness::new();
        let a = h.catalog.publish(ManifestBuilder::new("acme.app").build());
        h.participant.fail_post_install_of("acme.app");
        let mut events = h.service.subscribe();

        h.service
            .install_from_catalog(a, InstallOptions::default())
            .await
            .unwrap_err();

        let events = drain_events(&mut events);
        let will = events
            .iter()
            .position(|e| matches!(e, LifecycleEvent::WillUninstall { .. }))
            .unwrap();
        let did = events
            .iter()
            .position(|e| matches!(e, LifecycleEvent::DidUninstall { error: None, .. }))
            .unwrap();
        let settled = events
            .iter()
            .position(|e| matches!(e, LifecycleEvent::DidInstall { .. }))
            .unwrap();
        assert!(will < did && did < settled);
        assert!(h.installer.installed(&default_profile()).is_empty());
    }

    #[tokio::test]
    async fn test_catalog_disabled_rejects_batch() {
        let h = Harness::new();
        let a = h.catalog.publish(ManifestBuilder::new("acme.app").build());
        h.catalog.set_enabled(false);

        let err = h
            .service
            .install_extensions(vec![InstallRequest::catalog(a, InstallOptions::default())])
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::NotAllowed);
        assert!(h.installer.ops().is_empty());
    }

    #[tokio::test]
    async fn test_incompatible_dependency_fails_batch() {
        let h = Harness::new();
        let a = h
            .catalog
            .publish(ManifestBuilder::new("acme.app").depends_on(&["acme.old"]).build());
        h.catalog.publish(ManifestBuilder::new("acme.old").build());
        h.catalog.mark_incompatible("acme.old");

        let results = h
            .service
            .install_extensions(vec![InstallRequest::catalog(a, InstallOptions::default())])
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error().unwrap().code, ErrorCode::Incompatible);
        assert!(h.installer.ops().is_empty());
    }

    #[tokio::test]
    async fn test_incompatible_pack_member_is_skipped() {
        let h = Harness::new();
        let pack = h.catalog.publish(
            ManifestBuilder::new("acme.pack")
                .pack(&["acme.good", "acme.bad"])
                .build(),
        );
        h.catalog.publish(ManifestBuilder::new("acme.good").build());
        h.catalog.publish(ManifestBuilder::new("acme.bad").build());
        h.catalog.mark_incompatible("acme.bad");

        let results = h
            .service
            .install_extensions(vec![InstallRequest::catalog(pack, InstallOptions::default())])
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_success()));
        assert_eq!(
            h.installer.installed_ids(&default_profile()),
            vec!["acme.good", "acme.pack"]
        );
    }

    #[tokio::test]
    async fn test_blocked_request_fails_alone() {
        let config = ManagementConfig {
            blocked_extensions: vec!["evil.*".to_string()],
            ..Default::default()
        };
        let h = Harness::with_config(config);
        let evil = h.catalog.publish(ManifestBuilder::new("evil.tool").build());
        let good = h.catalog.publish(ManifestBuilder::new("acme.tool").build());

        let results = h
            .service
            .install_extensions(vec![
                InstallRequest::catalog(evil, InstallOptions::default()),
                InstallRequest::catalog(good, InstallOptions::default()),
            ])
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        let evil = results
            .iter()
            .find(|r| r.identifier.matches_id("evil.tool"))
            .unwrap();
        assert_eq!(evil.error().unwrap().code, ErrorCode::NotAllowed);
        assert_eq!(h.installer.installed_ids(&default_profile()), vec!["acme.tool"]);
    }

    #[tokio::test]
    async fn test_malicious_extension_is_refused() {
        let h = Harness::new();
        let bad = h.catalog.publish(ManifestBuilder::new("shady.miner").build());
        h.catalog.set_control_list(ControlList {
            malicious: vec![bad.identifier.clone()],
            ..Default::default()
        });

        let err = h
            .service
            .install_from_catalog(bad, InstallOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::Malicious);
    }

    #[tokio::test]
    async fn test_deprecated_extension_migrates_to_replacement() {
        let h = Harness::new();
        let old = h.catalog.publish(ManifestBuilder::new("acme.old").build());
        h.catalog.publish(ManifestBuilder::new("acme.new").build());
        let mut list = ControlList::default();
        list.deprecated.insert(
            "acme.old".to_string(),
            DeprecationInfo {
                extension: Some(DeprecationReplacement {
                    id: "acme.new".to_string(),
                    auto_migrate: true,
                    pre_release: false,
                }),
            },
        );
        h.catalog.set_control_list(list);

        let local = h
            .service
            .install_from_catalog(old, InstallOptions::default())
            .await
            .unwrap();

        assert!(local.identifier.matches_id("acme.new"));
        assert_eq!(h.installer.installed_ids(&default_profile()), vec!["acme.new"]);
    }

    #[tokio::test]
    async fn test_deprecated_without_replacement_fails() {
        let h = Harness::new();
        let old = h.catalog.publish(ManifestBuilder::new("acme.old").build());
        let mut list = ControlList::default();
        list.deprecated.insert(
            "acme.old".to_string(),
            DeprecationInfo {
                extension: Some(DeprecationReplacement {
                    id: "acme.gone".to_string(),
                    auto_migrate: true,
                    pre_release: false,
                }),
            },
        );
        h.catalog.set_control_list(list);

        let err = h
            .service
            .install_from_catalog(old, InstallOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::Deprecated);
    }

    #[tokio::test]
    async fn test_unsupported_api_proposal_is_refused() {
        let h = Harness::new();
        let a = h.catalog.publish(
            ManifestBuilder::new("acme.app")
                .api_proposals(&["terminalShellIntegration"])
                .build(),
        );

        let err = h
            .service
            .install_from_catalog(a, InstallOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::IncompatibleApi);
    }

    #[tokio::test]
    async fn test_application_scoped_dependency_goes_to_default_profile() {
        let h = Harness::new();
        let a = h
            .catalog
            .publish(ManifestBuilder::new("acme.app").depends_on(&["acme.shared"]).build());
        h.catalog.publish(
            ManifestBuilder::new("acme.shared")
                .application_scoped()
                .build(),
        );

        let results = h
            .service
            .install_extensions(vec![InstallRequest::catalog(
                a,
                InstallOptions::default().with_profile(work_profile()),
            )])
            .await
            .unwrap();

        assert!(results.iter().all(|r| r.is_success()));
        assert_eq!(h.installer.installed_ids(&work_profile()), vec!["acme.app"]);
        assert_eq!(
            h.installer.installed_ids(&default_profile()),
            vec!["acme.shared"]
        );
    }

    #[tokio::test]
    async fn test_without_dependencies_installs_root_only() {
        let h = Harness::new();
        let a = h
            .catalog
            .publish(ManifestBuilder::new("acme.app").depends_on(&["acme.lib"]).build());
        h.catalog.publish(ManifestBuilder::new("acme.lib").build());

        let results = h
            .service
            .install_extensions(vec![InstallRequest::catalog(
                a,
                InstallOptions::default().without_dependencies(),
            )])
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(h.installer.installed_ids(&default_profile()), vec!["acme.app"]);
    }

    #[tokio::test]
    async fn test_artifact_install_skips_dependencies() {
        let h = Harness::new();
        h.catalog.publish(ManifestBuilder::new("acme.lib").build());
        let artifact = ArtifactSource {
            location: "/tmp/acme.app-1.0.0.pkg".into(),
            manifest: ManifestBuilder::new("acme.app")
                .depends_on(&["acme.lib"])
                .build(),
        };

        let local = h
            .service
            .install_artifact(artifact, InstallOptions::default())
            .await
            .unwrap();

        assert_eq!(local.metadata.source, Some(InstallSourceKind::Artifact));
        assert_eq!(h.installer.installed_ids(&default_profile()), vec!["acme.app"]);
    }

    #[tokio::test]
    async fn test_artifact_with_invalid_identifier_is_rejected() {
        let h = Harness::new();
        let mut manifest = ManifestBuilder::new("acme.app").build();
        manifest.publisher = String::new();
        let artifact = ArtifactSource {
            location: "/tmp/broken.pkg".into(),
            manifest,
        };

        let err = h
            .service
            .install_artifact(artifact, InstallOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::Invalid);
    }

    #[tokio::test]
    async fn test_duplicate_requests_in_batch_install_once() {
        let h = Harness::new();
        let a = h.catalog.publish(ManifestBuilder::new("acme.app").build());

        let results = h
            .service
            .install_extensions(vec![
                InstallRequest::catalog(a.clone(), InstallOptions::default()),
                InstallRequest::catalog(a, InstallOptions::default()),
            ])
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(
            h.installer.count(|op| matches!(op, InstallerOp::Written(..))),
            1
        );
    }

    #[tokio::test]
    async fn test_update_metadata_emits_event() {
        let h = Harness::new();
        let installed = local(ManifestBuilder::new("acme.app").build());
        h.installer.seed(&default_profile(), installed.clone());
        let mut events = h.service.subscribe();

        let patch = extman_core::types::MetadataPatch {
            pinned: Some(true),
            ..Default::default()
        };
        let updated = h
            .service
            .update_metadata(&installed, patch, None)
            .await
            .unwrap();

        assert!(updated.metadata.pinned);
        let events = drain_events(&mut events);
        assert!(matches!(
            events.as_slice(),
            [LifecycleEvent::MetadataUpdated { profile_location, .. }]
                if profile_location == &ProfileLocation::new(DEFAULT_PROFILE)
        ));
    }
}
