// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session persistence: status ladder, snapshot, and ordered job specs,
//! enough to resume a session after a restart.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::job::JobSpec;
use crate::session::{SessionDetail, SessionId};

/// Persisted progress ladder; later statuses imply earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistedStatus {
    SessionSubmitted,
    SessionStarted,
    SessionEnded,
}

/// The stored record for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub status: PersistedStatus,
    pub snapshot: SessionDetail,
    /// Job specs in creation order, for reload on resume.
    pub jobs: Vec<JobSpec>,
}

/// Storage seam for session snapshots.
pub trait SessionPersister: Send + Sync {
    fn save(&self, record: &PersistedSession) -> anyhow::Result<()>;

    fn load(&self, id: &SessionId) -> anyhow::Result<Option<PersistedSession>>;

    fn remove(&self, id: &SessionId) -> anyhow::Result<()>;
}

/// In-memory persister; the default when no store is wired.
#[derive(Default)]
pub struct MemoryPersister {
    records: Mutex<HashMap<SessionId, PersistedSession>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionPersister for MemoryPersister {
    fn save(&self, record: &PersistedSession) -> anyhow::Result<()> {
        self.records.lock().insert(record.snapshot.id.clone(), record.clone());
        Ok(())
    }

    fn load(&self, id: &SessionId) -> anyhow::Result<Option<PersistedSession>> {
        Ok(self.records.lock().get(id).cloned())
    }

    fn remove(&self, id: &SessionId) -> anyhow::Result<()> {
        self.records.lock().remove(id);
        Ok(())
    }
}

/// File-backed persister: one JSON document per session under `dir`.
pub struct FilePersister {
    dir: PathBuf,
}

impl FilePersister {
    pub fn new(dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &SessionId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl SessionPersister for FilePersister {
    fn save(&self, record: &PersistedSession) -> anyhow::Result<()> {
        let path = self.path_for(&record.snapshot.id);
        let body = serde_json::to_vec_pretty(record)?;
        // Write-then-rename so readers never observe a torn record.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, id: &SessionId) -> anyhow::Result<Option<PersistedSession>> {
        let path = self.path_for(id);
        match std::fs::read(&path) {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn remove(&self, id: &SessionId) -> anyhow::Result<()> {
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
#[path = "persist_tests.rs"]
mod tests;
