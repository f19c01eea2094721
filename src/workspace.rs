//! Workspace registry (spec.md §3 "Workspace"): a thin, persisted directory
//! of user-defined workspaces plus their watch-directory association. The
//! `GLOBAL` sentinel workspace is owned by `Storage`, not here — this is
//! purely the host-facing catalogue of *other* workspaces and the
//! filesystem roots the Watcher should observe for each.
//!
//! File-explorer CRUD (directory listing, file stat, read/write) lived here
//! in the teacher and has no counterpart in SPEC_FULL.md's scope — dropped
//! in the trim pass along with `routes/files.rs`. See `DESIGN.md`.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    #[serde(alias = "root_path")]
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub is_active: bool,
}

impl Workspace {
    pub fn root_path(&self) -> &str {
        &self.path
    }
}

/// Emits both `path` and `root_path` so existing hosts built against the
/// teacher's file-explorer API keep working against either key.
impl Serialize for Workspace {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("Workspace", 6)?;
        s.serialize_field("id", &self.id)?;
        s.serialize_field("name", &self.name)?;
        s.serialize_field("path", &self.path)?;
        s.serialize_field("root_path", &self.path)?;
        s.serialize_field("created_at", &self.created_at)?;
        s.serialize_field("last_accessed", &self.last_accessed)?;
        s.serialize_field("is_active", &self.is_active)?;
        s.end()
    }
}

pub struct WorkspaceManager {
    workspaces: DashMap<String, Workspace>,
    data_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(data_dir: PathBuf) -> Self {
        let manager = Self { workspaces: DashMap::new(), data_dir };
        if let Ok(content) = std::fs::read_to_string(manager.workspaces_file()) {
            if let Ok(workspaces) = serde_json::from_str::<Vec<Workspace>>(&content) {
                for ws in workspaces {
                    manager.workspaces.insert(ws.id.clone(), ws);
                }
            }
        }
        manager
    }

    fn workspaces_file(&self) -> PathBuf {
        self.data_dir.join("workspaces.json")
    }

    fn persist(&self) -> EngineResult<()> {
        let workspaces: Vec<Workspace> = self.workspaces.iter().map(|e| e.value().clone()).collect();
        let json = serde_json::to_string_pretty(&workspaces)?;
        std::fs::create_dir_all(&self.data_dir)?;
        let target = self.workspaces_file();
        let tmp = target.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    pub fn create_workspace(&self, name: String, path: String) -> EngineResult<Workspace> {
        let canonical = dunce::canonicalize(&path)
            .map_err(|_| EngineError::PathInvalid(format!("path does not exist: {path}")))?;

        for entry in self.workspaces.iter() {
            if dunce::canonicalize(&entry.value().path).map(|p| p == canonical).unwrap_or(false) {
                return Err(EngineError::BadRequest(format!("workspace already exists for path: {path}")));
            }
        }

        let workspace = Workspace {
            id: Uuid::new_v4().to_string(),
            name,
            path: canonical.to_string_lossy().to_string(),
            created_at: Utc::now(),
            last_accessed: Utc::now(),
            is_active: false,
        };

        self.workspaces.insert(workspace.id.clone(), workspace.clone());
        self.persist()?;
        Ok(workspace)
    }

    pub fn get_workspace(&self, id: &str) -> EngineResult<Workspace> {
        self.workspaces.get(id).map(|e| e.value().clone()).ok_or_else(|| EngineError::WorkspaceNotFound(id.to_string()))
    }

    pub fn list_workspaces(&self) -> Vec<Workspace> {
        let mut workspaces: Vec<Workspace> = self.workspaces.iter().map(|e| e.value().clone()).collect();
        workspaces.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        workspaces
    }

    pub fn remove_workspace(&self, id: &str) -> EngineResult<()> {
        self.workspaces.remove(id).ok_or_else(|| EngineError::WorkspaceNotFound(id.to_string()))?;
        self.persist()?;
        Ok(())
    }

    pub fn activate_workspace(&self, id: &str) -> EngineResult<Workspace> {
        for mut entry in self.workspaces.iter_mut() {
            entry.value_mut().is_active = false;
        }
        let mut ws = self.workspaces.get_mut(id).ok_or_else(|| EngineError::WorkspaceNotFound(id.to_string()))?;
        ws.is_active = true;
        ws.last_accessed = Utc::now();
        let result = ws.clone();
        drop(ws);
        self.persist()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_fetch_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path().join("data"));
        let target = tempfile::tempdir().unwrap();
        let ws = manager.create_workspace("demo".to_string(), target.path().to_string_lossy().to_string()).unwrap();
        let fetched = manager.get_workspace(&ws.id).unwrap();
        assert_eq!(fetched.id, ws.id);
    }

    #[test]
    fn duplicate_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path().join("data"));
        let target = tempfile::tempdir().unwrap();
        manager.create_workspace("a".to_string(), target.path().to_string_lossy().to_string()).unwrap();
        let result = manager.create_workspace("b".to_string(), target.path().to_string_lossy().to_string());
        assert!(result.is_err());
    }

    #[test]
    fn activate_deactivates_others() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path().join("data"));
        let t1 = tempfile::tempdir().unwrap();
        let t2 = tempfile::tempdir().unwrap();
        let ws1 = manager.create_workspace("a".to_string(), t1.path().to_string_lossy().to_string()).unwrap();
        let ws2 = manager.create_workspace("b".to_string(), t2.path().to_string_lossy().to_string()).unwrap();
        manager.activate_workspace(&ws1.id).unwrap();
        manager.activate_workspace(&ws2.id).unwrap();
        assert!(!manager.get_workspace(&ws1.id).unwrap().is_active);
        assert!(manager.get_workspace(&ws2.id).unwrap().is_active);
    }
}
