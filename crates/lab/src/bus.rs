// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scoped event bus: delivers typed events synchronously to subscribers
//! grouped into ordered scopes, with per-subscriber error isolation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::event::{Event, SkipDecision, SkipSignal};

/// Subscriber buckets, ordered for pre-driver fan-out. Post-driver fan-out
/// posts the same scopes in reverse, with subscribers inside each scope
/// also reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    ClassInternal,
    GlobalInternal,
    InternalPlugin,
    ApiPlugin,
    ArchivePlugin,
    /// Asynchronous test-to-plugin message delivery; never part of the
    /// lifecycle fan-out orders.
    TestMessage,
}

impl Scope {
    /// Pre-driver fan-out order.
    pub const FORWARD: [Scope; 5] = [
        Scope::ClassInternal,
        Scope::GlobalInternal,
        Scope::InternalPlugin,
        Scope::ApiPlugin,
        Scope::ArchivePlugin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClassInternal => "class_internal",
            Self::GlobalInternal => "global_internal",
            Self::InternalPlugin => "internal_plugin",
            Self::ApiPlugin => "api_plugin",
            Self::ArchivePlugin => "archive_plugin",
            Self::TestMessage => "test_message",
        }
    }
}

/// Direction of a lifecycle fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// Explicit id allocated at registration; identifies the subscriber
/// instance in error records.
pub type SubscriberId = u32;

/// An object observing lifecycle events.
///
/// Returning `Ok(Some(signal))` raises a skip-test veto; returning `Err`
/// records a plugin error without interrupting dispatch to later
/// subscribers.
pub trait Subscriber: Send + Sync {
    fn handle(&self, event: &Event) -> anyhow::Result<Option<SkipSignal>>;
}

/// A recorded subscriber failure, kept on the session and never propagated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginErrorRecord {
    pub plugin_label: String,
    pub subscriber_id: SubscriberId,
    pub event: String,
    pub message: String,
}

/// A skip signal together with the plugin that raised it.
#[derive(Debug, Clone)]
pub struct SkipOutcome {
    pub plugin_label: String,
    pub signal: SkipSignal,
}

/// Result of one event post.
#[derive(Debug, Default)]
pub struct PostOutcome {
    pub skips: Vec<SkipOutcome>,
    pub errors: Vec<PluginErrorRecord>,
}

impl PostOutcome {
    /// Aggregate all vetoes raised during the post.
    pub fn skip_decision(&self) -> Option<SkipDecision> {
        SkipDecision::aggregate(self.skips.iter().map(|s| s.signal.clone()))
    }

    pub fn merge(&mut self, other: PostOutcome) {
        self.skips.extend(other.skips);
        self.errors.extend(other.errors);
    }
}

struct Entry {
    id: SubscriberId,
    label: String,
    subscriber: Arc<dyn Subscriber>,
}

/// Scoped subscriber registry for one session.
///
/// Registration happens during session initialization; dispatch holds no
/// lock while a subscriber runs.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU32,
    scopes: RwLock<HashMap<Scope, Vec<Arc<Entry>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; within a scope, dispatch follows insertion
    /// order.
    pub fn register(
        &self,
        scope: Scope,
        label: impl Into<String>,
        subscriber: Arc<dyn Subscriber>,
    ) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry { id, label: label.into(), subscriber });
        self.scopes.write().entry(scope).or_default().push(entry);
        id
    }

    /// Post an event across the lifecycle scopes in the given direction.
    pub fn post(&self, event: &Event, direction: Direction) -> PostOutcome {
        let mut entries: Vec<Arc<Entry>> = Vec::new();
        {
            let scopes = self.scopes.read();
            match direction {
                Direction::Forward => {
                    for scope in Scope::FORWARD {
                        if let Some(list) = scopes.get(&scope) {
                            entries.extend(list.iter().cloned());
                        }
                    }
                }
                Direction::Reverse => {
                    for scope in Scope::FORWARD.iter().rev() {
                        if let Some(list) = scopes.get(scope) {
                            entries.extend(list.iter().rev().cloned());
                        }
                    }
                }
            }
        }
        self.dispatch(event, &entries)
    }

    /// Post only to the dedicated test-message scope.
    pub fn post_test_message(&self, event: &Event) -> PostOutcome {
        let entries: Vec<Arc<Entry>> = self
            .scopes
            .read()
            .get(&Scope::TestMessage)
            .map(|list| list.to_vec())
            .unwrap_or_default();
        self.dispatch(event, &entries)
    }

    /// Post across lifecycle scopes, restricted to subscribers carrying the
    /// given label. Used for labelled session notifications.
    pub fn post_to_label(&self, event: &Event, direction: Direction, label: &str) -> PostOutcome {
        let mut entries: Vec<Arc<Entry>> = Vec::new();
        {
            let scopes = self.scopes.read();
            let ordered: Vec<&Scope> = match direction {
                Direction::Forward => Scope::FORWARD.iter().collect(),
                Direction::Reverse => Scope::FORWARD.iter().rev().collect(),
            };
            for scope in ordered {
                if let Some(list) = scopes.get(scope) {
                    entries.extend(list.iter().filter(|e| e.label == label).cloned());
                }
            }
        }
        self.dispatch(event, &entries)
    }

    fn dispatch(&self, event: &Event, entries: &[Arc<Entry>]) -> PostOutcome {
        let mut outcome = PostOutcome::default();
        for entry in entries {
            match entry.subscriber.handle(event) {
                Ok(None) => {}
                Ok(Some(signal)) => {
                    outcome
                        .skips
                        .push(SkipOutcome { plugin_label: entry.label.clone(), signal });
                }
                Err(err) => {
                    warn!(
                        plugin_label = %entry.label,
                        subscriber_id = entry.id,
                        event = event.name(),
                        error = %format!("{err:#}"),
                        "subscriber failed; continuing dispatch"
                    );
                    outcome.errors.push(PluginErrorRecord {
                        plugin_label: entry.label.clone(),
                        subscriber_id: entry.id,
                        event: event.name().to_owned(),
                        message: format!("{err:#}"),
                    });
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
