// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Plugin host: materializes subscriber instances from declarative
//! configuration through a registry of factory functions.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bus::{Scope, Subscriber};
use crate::clock::Clock;
use crate::device::DeviceQuery;
use crate::error::{ErrorCode, LabError};
use crate::pool::TaskPool;
use crate::session::SessionInfo;

/// Size of the per-plugin task pool.
const PLUGIN_POOL_CAPACITY: usize = 8;

/// Declarative plugin configuration carried in the session config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Registered factory name.
    pub class_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
    /// Explicit label; defaults to the class name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Opaque plugin-specific configuration blob.
    #[serde(default)]
    pub execution_config: serde_json::Value,
}

impl PluginSpec {
    pub fn named(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            module_name: None,
            label: None,
            execution_config: serde_json::Value::Null,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_execution_config(mut self, config: serde_json::Value) -> Self {
        self.execution_config = config;
        self
    }

    pub fn effective_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.class_name)
    }
}

/// Session-scoped objects shared by every plugin of one session.
#[derive(Clone)]
pub struct ContextSeed {
    pub session: SessionInfo,
    pub device_query: Arc<dyn DeviceQuery>,
    pub server_start_ms: u64,
    pub gen_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub clock: Arc<dyn Clock>,
}

/// Binding context handed to plugin factories.
pub struct PluginContext {
    pub session: SessionInfo,
    /// Effective label of the plugin being constructed.
    pub label: String,
    pub device_query: Arc<dyn DeviceQuery>,
    pub server_start_ms: u64,
    pub gen_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub clock: Arc<dyn Clock>,
    /// Bounded pool named `session-plugin-<label>-thread-pool`, shut down
    /// when the plugin closes.
    pub pool: Arc<TaskPool>,
    pub execution_config: serde_json::Value,
}

/// A resource released after `ended` dispatch completes.
pub trait Closeable: Send + Sync {
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

impl Closeable for TaskPool {
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move { TaskPool::close(self).await })
    }
}

/// A factory's product: the subscriber plus everything to close with it.
pub struct CreatedPlugin {
    pub subscriber: Arc<dyn Subscriber>,
    /// Lifecycle scope the subscriber registers under.
    pub scope: Scope,
    /// Also register for asynchronous test messages.
    pub subscribe_test_messages: bool,
    pub closeables: Vec<Arc<dyn Closeable>>,
    /// Payload type names this plugin declares for notification decoding.
    pub payload_types: Vec<String>,
}

impl CreatedPlugin {
    pub fn subscriber_only(subscriber: Arc<dyn Subscriber>) -> Self {
        Self {
            subscriber,
            scope: Scope::ApiPlugin,
            subscribe_test_messages: false,
            closeables: Vec::new(),
            payload_types: Vec::new(),
        }
    }

    pub fn with_test_messages(mut self) -> Self {
        self.subscribe_test_messages = true;
        self
    }

    pub fn in_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }
}

pub type PluginFactory =
    Arc<dyn Fn(&PluginContext) -> anyhow::Result<CreatedPlugin> + Send + Sync>;

/// An instantiated plugin bound to its session.
pub struct SessionPlugin {
    pub label: String,
    pub class_name: String,
    pub subscriber: Arc<dyn Subscriber>,
    pub scope: Scope,
    pub subscribe_test_messages: bool,
    pub payload_types: Vec<String>,
    closeables: Vec<Arc<dyn Closeable>>,
}

impl SessionPlugin {
    /// Release the plugin's resources; called after `ended` dispatch.
    pub async fn close(&self) {
        for closeable in &self.closeables {
            closeable.close().await;
        }
    }
}

/// Registry of factory functions keyed by class name.
///
/// Unknown names fail at submission time, like the source's
/// builtin-plugin-not-found contract.
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class_name: impl Into<String>, factory: PluginFactory) {
        self.factories.insert(class_name.into(), factory);
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.factories.contains_key(class_name)
    }

    /// Validate plugin specs at submission time: every class must resolve
    /// and effective labels must be unique within the session.
    pub fn check_specs(&self, specs: &[PluginSpec]) -> anyhow::Result<()> {
        let mut labels: BTreeMap<&str, &str> = BTreeMap::new();
        for spec in specs {
            if !self.contains(&spec.class_name) {
                return Err(LabError::new(
                    ErrorCode::PluginClassNotFound,
                    format!("no builtin plugin named {}", spec.class_name),
                )
                .into());
            }
            let label = spec.effective_label();
            if let Some(previous) = labels.insert(label, &spec.class_name) {
                return Err(LabError::new(
                    ErrorCode::DuplicatedPluginLabel,
                    format!(
                        "plugin label {label} used by both {previous} and {}",
                        spec.class_name
                    ),
                )
                .into());
            }
        }
        Ok(())
    }

    /// Instantiate one plugin with its own bounded pool.
    pub fn create(&self, spec: &PluginSpec, seed: &ContextSeed) -> anyhow::Result<SessionPlugin> {
        let factory = self.factories.get(&spec.class_name).ok_or_else(|| {
            LabError::new(
                ErrorCode::PluginClassNotFound,
                format!("no builtin plugin named {}", spec.class_name),
            )
        })?;

        let label = spec.effective_label().to_owned();
        let pool =
            TaskPool::new(format!("session-plugin-{label}-thread-pool"), PLUGIN_POOL_CAPACITY);
        let context = PluginContext {
            session: seed.session.clone(),
            label: label.clone(),
            device_query: Arc::clone(&seed.device_query),
            server_start_ms: seed.server_start_ms,
            gen_dir: seed.gen_dir.clone(),
            tmp_dir: seed.tmp_dir.clone(),
            clock: Arc::clone(&seed.clock),
            pool: Arc::clone(&pool),
            execution_config: spec.execution_config.clone(),
        };

        let created = factory(&context).map_err(|err| {
            LabError::new(
                ErrorCode::PluginCreationFailed,
                format!("failed to create session plugin {}: {err:#}", spec.class_name),
            )
        })?;

        let mut closeables: Vec<Arc<dyn Closeable>> = vec![pool];
        closeables.extend(created.closeables);

        Ok(SessionPlugin {
            label,
            class_name: spec.class_name.clone(),
            subscriber: created.subscriber,
            scope: created.scope,
            subscribe_test_messages: created.subscribe_test_messages,
            payload_types: created.payload_types,
            closeables,
        })
    }
}

#[cfg(test)]
#[path = "plugin_tests.rs"]
mod tests;
