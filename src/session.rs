use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::SessionError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Reaped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionHandle {
    pub session_id: String,
    pub workspace_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub output_files: Vec<OutputFile>,
    pub status: SessionStatus,
}

/// Issues isolated per-client workspaces and tracks their artifacts.
///
/// The id→metadata table is the only state mutated by concurrent client
/// requests and every operation goes through its single lock. A best-effort
/// JSON mirror under the workspace base survives restarts; it is not
/// transactional. Files themselves are partitioned per session, so no
/// cross-session file locking exists anywhere.
pub struct SessionRegistry {
    base_dir: PathBuf,
    sessions_file: PathBuf,
    inner: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn load_or_create(base_dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&base_dir)?;
        let sessions_file = base_dir.join("sessions.json");

        let sessions = match std::fs::read(&sessions_file) {
            Ok(data) => match serde_json::from_slice::<HashMap<String, SessionHandle>>(&data) {
                Ok(sessions) => {
                    info!(count = sessions.len(), "loaded session metadata from disk");
                    sessions
                }
                Err(e) => {
                    warn!(error = %e, "session metadata unreadable, starting fresh");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            base_dir,
            sessions_file,
            inner: Mutex::new(sessions),
        })
    }

    /// Allocate a fresh opaque session id and a dedicated workspace
    /// directory named from it.
    pub fn create(&self) -> std::io::Result<SessionHandle> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let workspace_dir = self.base_dir.join(format!("session_{session_id}"));
        std::fs::create_dir_all(&workspace_dir)?;

        let now = Utc::now();
        let handle = SessionHandle {
            session_id: session_id.clone(),
            workspace_dir,
            created_at: now,
            last_accessed: now,
            output_files: Vec::new(),
            status: SessionStatus::Active,
        };

        let mut inner = self.inner.lock();
        inner.insert(session_id, handle.clone());
        self.flush(&inner);
        info!(session_id = %handle.session_id, "created session");
        Ok(handle)
    }

    pub fn is_valid(&self, session_id: &str) -> bool {
        let mut inner = self.inner.lock();
        active_mut(&mut inner, session_id).is_ok()
    }

    pub fn workspace_dir(&self, session_id: &str) -> Result<PathBuf, SessionError> {
        let mut inner = self.inner.lock();
        let session = active_mut(&mut inner, session_id)?;
        Ok(session.workspace_dir.clone())
    }

    /// Record an artifact for a session. The path must resolve under that
    /// session's own workspace; anything else is rejected.
    pub fn register_output_file(
        &self,
        session_id: &str,
        path: &Path,
    ) -> Result<PathBuf, SessionError> {
        let mut inner = self.inner.lock();
        let session = active_mut(&mut inner, session_id)?;

        let resolved = resolve_in_workspace(&session.workspace_dir, path)
            .ok_or_else(|| SessionError::PathOutsideWorkspace(path.display().to_string()))?;

        let size_bytes = std::fs::metadata(&resolved).map(|m| m.len()).unwrap_or(0);
        session.output_files.push(OutputFile {
            path: resolved.clone(),
            size_bytes,
            created_at: Utc::now(),
        });
        info!(session_id, path = %resolved.display(), size_bytes, "registered output file");

        self.flush(&inner);
        Ok(resolved)
    }

    pub fn files(&self, session_id: &str) -> Result<Vec<OutputFile>, SessionError> {
        let mut inner = self.inner.lock();
        let session = active_mut(&mut inner, session_id)?;
        Ok(session.output_files.clone())
    }

    /// Most recently registered artifact, re-verified to still exist on
    /// disk.
    pub fn latest_output_file(&self, session_id: &str) -> Result<Option<PathBuf>, SessionError> {
        let mut inner = self.inner.lock();
        let session = active_mut(&mut inner, session_id)?;

        let mut files: Vec<&OutputFile> = session.output_files.iter().collect();
        files.sort_by_key(|f| f.created_at);
        for file in files.iter().rev() {
            if file.path.exists() {
                return Ok(Some(file.path.clone()));
            }
            warn!(path = %file.path.display(), "registered artifact missing on disk, skipping");
        }
        Ok(None)
    }

    /// Delete every session idle past the threshold: workspace tree, files
    /// and artifact records. Reaped is terminal; a stale client must create
    /// a new session.
    pub fn reap(&self, max_age_hours: i64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::hours(max_age_hours);
        let mut doomed_dirs = Vec::new();

        {
            let mut inner = self.inner.lock();
            for session in inner.values_mut() {
                if session.status == SessionStatus::Active && session.last_accessed < cutoff {
                    session.status = SessionStatus::Reaped;
                    session.output_files.clear();
                    doomed_dirs.push((session.session_id.clone(), session.workspace_dir.clone()));
                }
            }
            if !doomed_dirs.is_empty() {
                self.flush(&inner);
            }
        }

        for (session_id, dir) in &doomed_dirs {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                if dir.exists() {
                    warn!(session_id = %session_id, error = %e, "failed to remove reaped workspace");
                }
            }
            info!(session_id = %session_id, "reaped idle session");
        }

        doomed_dirs.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .count()
    }

    pub async fn reaper_loop(self: Arc<Self>, interval_secs: u64, max_age_hours: i64) {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            self.reap(max_age_hours);
        }
    }

    fn flush(&self, sessions: &HashMap<String, SessionHandle>) {
        match serde_json::to_vec_pretty(sessions) {
            Ok(data) => {
                if let Err(e) = std::fs::write(&self.sessions_file, data) {
                    warn!(error = %e, "failed to persist session metadata");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize session metadata"),
        }
    }

    #[cfg(test)]
    fn backdate_last_access(&self, session_id: &str, hours: i64) {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.get_mut(session_id) {
            session.last_accessed = Utc::now() - ChronoDuration::hours(hours);
        }
    }
}

/// Any access to an active session refreshes its last-access stamp.
/// Unknown and reaped ids both surface as NotFound.
fn active_mut<'a>(
    sessions: &'a mut HashMap<String, SessionHandle>,
    session_id: &str,
) -> Result<&'a mut SessionHandle, SessionError> {
    match sessions.get_mut(session_id) {
        Some(session) if session.status == SessionStatus::Active => {
            session.last_accessed = Utc::now();
            Ok(session)
        }
        _ => Err(SessionError::NotFound),
    }
}

fn resolve_in_workspace(workspace: &Path, path: &Path) -> Option<PathBuf> {
    let candidate = if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    };
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return None;
    }
    candidate.starts_with(workspace).then_some(candidate)
}
