//! Local-file watermark backend.
//!
//! The record is pretty-printed JSON. Writes go to `<path>.tmp` followed
//! by a rename, which is atomic within a filesystem — a crash mid-write
//! leaves either the old record or the new one, never a torn file.

use std::path::PathBuf;

use super::{State, StateBackend, StateError};

pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> FileBackend {
        FileBackend { path: path.into() }
    }
}

#[async_trait::async_trait]
impl StateBackend for FileBackend {
    async fn load(&self) -> Result<Option<State>, StateError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = serde_json::from_slice(&data)?;
        Ok(Some(state))
    }

    async fn persist(&self, state: &State) -> Result<(), StateError> {
        let data = serde_json::to_vec_pretty(state)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
