// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use super::{ContextSeed, CreatedPlugin, PluginContext, PluginRegistry, PluginSpec};
use crate::bus::Subscriber;
use crate::clock::SystemClock;
use crate::device::{DeviceQuery, DeviceSnapshot};
use crate::error::{error_code, ErrorCode};
use crate::event::{Event, SkipSignal};
use crate::session::SessionInfo;

struct NoDevices;

impl DeviceQuery for NoDevices {
    fn list_devices(&self) -> Vec<DeviceSnapshot> {
        Vec::new()
    }
}

struct Quiet;

impl Subscriber for Quiet {
    fn handle(&self, _event: &Event) -> anyhow::Result<Option<SkipSignal>> {
        Ok(None)
    }
}

fn seed() -> ContextSeed {
    ContextSeed {
        session: SessionInfo { id: "s-1".to_owned(), name: "plug".to_owned() },
        device_query: Arc::new(NoDevices),
        server_start_ms: 0,
        gen_dir: std::env::temp_dir(),
        tmp_dir: std::env::temp_dir(),
        clock: Arc::new(SystemClock),
    }
}

fn registry_with_quiet() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register(
        "quiet_plugin",
        Arc::new(|_cx: &PluginContext| Ok(CreatedPlugin::subscriber_only(Arc::new(Quiet)))),
    );
    registry
}

#[test]
fn effective_label_defaults_to_class_name() {
    let spec = PluginSpec::named("quiet_plugin");
    assert_eq!(spec.effective_label(), "quiet_plugin");
    let labelled = PluginSpec::named("quiet_plugin").with_label("custom");
    assert_eq!(labelled.effective_label(), "custom");
}

#[test]
fn unknown_class_fails_submission_check() -> anyhow::Result<()> {
    let registry = registry_with_quiet();
    let Err(err) = registry.check_specs(&[PluginSpec::named("missing_plugin")]) else {
        anyhow::bail!("expected failure");
    };
    assert_eq!(error_code(&err), Some(ErrorCode::PluginClassNotFound));
    assert!(err.to_string().contains("missing_plugin"));
    Ok(())
}

#[test]
fn duplicate_labels_fail_submission_check() -> anyhow::Result<()> {
    let registry = registry_with_quiet();
    let specs = vec![
        PluginSpec::named("quiet_plugin").with_label("same"),
        PluginSpec::named("quiet_plugin").with_label("same"),
    ];
    let Err(err) = registry.check_specs(&specs) else {
        anyhow::bail!("expected failure");
    };
    assert_eq!(error_code(&err), Some(ErrorCode::DuplicatedPluginLabel));
    Ok(())
}

#[test]
fn implicit_and_explicit_label_collision_detected() {
    let registry = registry_with_quiet();
    let specs = vec![
        PluginSpec::named("quiet_plugin"),
        PluginSpec::named("quiet_plugin").with_label("quiet_plugin"),
    ];
    assert!(registry.check_specs(&specs).is_err());
}

#[test]
fn create_names_pool_after_label() -> anyhow::Result<()> {
    let mut registry = PluginRegistry::new();
    registry.register(
        "pool_probe",
        Arc::new(|cx: &PluginContext| {
            assert_eq!(cx.pool.name(), "session-plugin-probe-thread-pool");
            Ok(CreatedPlugin::subscriber_only(Arc::new(Quiet)))
        }),
    );
    let plugin = registry.create(&PluginSpec::named("pool_probe").with_label("probe"), &seed())?;
    assert_eq!(plugin.label, "probe");
    assert_eq!(plugin.class_name, "pool_probe");
    Ok(())
}

#[test]
fn execution_config_reaches_factory() -> anyhow::Result<()> {
    let mut registry = PluginRegistry::new();
    registry.register(
        "configured_plugin",
        Arc::new(|cx: &PluginContext| {
            assert_eq!(cx.execution_config["threshold"], 7);
            Ok(CreatedPlugin::subscriber_only(Arc::new(Quiet)))
        }),
    );
    let spec = PluginSpec::named("configured_plugin")
        .with_execution_config(serde_json::json!({"threshold": 7}));
    registry.create(&spec, &seed())?;
    Ok(())
}

#[test]
fn factory_failure_maps_to_creation_failed() -> anyhow::Result<()> {
    let mut registry = PluginRegistry::new();
    registry.register(
        "broken_plugin",
        Arc::new(|_cx: &PluginContext| anyhow::bail!("missing binding")),
    );
    let Err(err) = registry.create(&PluginSpec::named("broken_plugin"), &seed()) else {
        anyhow::bail!("expected failure");
    };
    assert_eq!(error_code(&err), Some(ErrorCode::PluginCreationFailed));
    assert!(err.to_string().contains("broken_plugin"));
    Ok(())
}

#[tokio::test]
async fn close_shuts_down_plugin_pool() -> anyhow::Result<()> {
    let registry = registry_with_quiet();
    let plugin = registry.create(&PluginSpec::named("quiet_plugin"), &seed())?;
    plugin.close().await;
    Ok(())
}
