use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::error::{
    CreateStateDirectorySnafu, EncodeLocalStateSnafu, ReadLocalStateSnafu, StorageResult,
    WriteLocalStateSnafu,
};
use super::ids::SessionId;

pub const STATE_DIRECTORY_NAME: &str = "counsel";
pub const STATE_FILE_NAME: &str = "state.json";

/// Client-local memory of the last active session, keyed per profile.
pub trait LastSessionCache: Send + Sync {
    fn load(&self) -> StorageResult<Option<SessionId>>;
    fn store(&self, session_id: &SessionId) -> StorageResult<()>;
    fn clear(&self) -> StorageResult<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalState {
    #[serde(default)]
    last_session_id: Option<SessionId>,
}

/// JSON file under the platform config directory.
#[derive(Debug, Clone)]
pub struct FileLastSessionCache {
    path: PathBuf,
}

impl FileLastSessionCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_state_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(STATE_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".counsel"))
    }

    pub fn for_profile(profile: &str) -> Self {
        Self::in_dir(&Self::default_state_dir(), profile)
    }

    pub fn in_dir(state_dir: &Path, profile: &str) -> Self {
        let profile = match profile.trim() {
            "" => "default",
            trimmed => trimmed,
        };
        Self::new(state_dir.join("profiles").join(profile).join(STATE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_state(&self) -> StorageResult<LocalState> {
        if !self.path.exists() {
            return Ok(LocalState::default());
        }

        let content = std::fs::read_to_string(&self.path).context(ReadLocalStateSnafu {
            stage: "read-local-state",
            path: display_path(&self.path),
        })?;

        // A corrupt file only loses the resume hint, so it degrades to empty state.
        match serde_json::from_str::<LocalState>(&content) {
            Ok(state) => Ok(state),
            Err(error) => {
                tracing::warn!(
                    path = %display_path(&self.path),
                    error = %error,
                    "ignoring unreadable local state file"
                );
                Ok(LocalState::default())
            }
        }
    }

    fn write_state(&self, state: &LocalState) -> StorageResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateStateDirectorySnafu {
                stage: "create-local-state-directory",
                path: display_path(parent),
            })?;
        }

        let content = serde_json::to_string_pretty(state).context(EncodeLocalStateSnafu {
            stage: "encode-local-state",
            path: display_path(&self.path),
        })?;

        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteLocalStateSnafu {
            stage: "write-temporary-local-state",
            path: display_path(&temp_path),
        })?;
        std::fs::rename(&temp_path, &self.path).context(WriteLocalStateSnafu {
            stage: "replace-local-state",
            path: display_path(&self.path),
        })
    }
}

impl LastSessionCache for FileLastSessionCache {
    fn load(&self) -> StorageResult<Option<SessionId>> {
        Ok(self.read_state()?.last_session_id)
    }

    fn store(&self, session_id: &SessionId) -> StorageResult<()> {
        let mut state = self.read_state()?;
        if state.last_session_id.as_ref() == Some(session_id) {
            return Ok(());
        }
        state.last_session_id = Some(session_id.clone());
        self.write_state(&state)
    }

    fn clear(&self) -> StorageResult<()> {
        let mut state = self.read_state()?;
        if state.last_session_id.take().is_none() {
            return Ok(());
        }
        self.write_state(&state)
    }
}

/// In-process cache for callers that do not persist anything.
#[derive(Debug, Default)]
pub struct MemoryLastSessionCache {
    last: Mutex<Option<SessionId>>,
}

impl MemoryLastSessionCache {
    pub fn new(initial: Option<SessionId>) -> Self {
        Self {
            last: Mutex::new(initial),
        }
    }
}

impl LastSessionCache for MemoryLastSessionCache {
    fn load(&self) -> StorageResult<Option<SessionId>> {
        Ok(self
            .last
            .lock()
            .map(|last| last.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone()))
    }

    fn store(&self, session_id: &SessionId) -> StorageResult<()> {
        let mut last = self
            .last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Some(session_id.clone());
        Ok(())
    }

    fn clear(&self) -> StorageResult<()> {
        let mut last = self
            .last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = None;
        Ok(())
    }
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_cache_round_trips_per_profile() {
        let temp = tempfile::tempdir().unwrap();
        let work = FileLastSessionCache::in_dir(temp.path(), "work");
        let home = FileLastSessionCache::in_dir(temp.path(), "home");

        assert_eq!(work.load().unwrap(), None);

        let session = SessionId::parse("session-1").unwrap();
        work.store(&session).unwrap();

        assert_eq!(work.load().unwrap(), Some(session));
        assert_eq!(home.load().unwrap(), None);

        work.clear().unwrap();
        assert_eq!(work.load().unwrap(), None);
    }

    #[test]
    fn corrupt_state_file_reads_as_empty() {
        let temp = tempfile::tempdir().unwrap();
        let cache = FileLastSessionCache::in_dir(temp.path(), "");
        std::fs::create_dir_all(cache.path().parent().unwrap()).unwrap();
        std::fs::write(cache.path(), "{not json").unwrap();

        assert_eq!(cache.load().unwrap(), None);
        assert!(cache.path().ends_with("profiles/default/state.json"));
    }
}
