//! File-backed operations store.
//!
//! Update and join commands keep their operation state in a JSON file under
//! the host-local state directory so they can make progress while the
//! cluster store is unavailable.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::ops::Operation;
use crate::storage::OperationsBackend;

/// Operations stored as a JSON array in a single file.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn read(&self) -> Result<Vec<Operation>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "no operation state at {}",
                    self.path.display()
                )))
            }
            Err(err) => return Err(Error::Io(err)),
        };
        serde_json::from_slice(&data)
            .map_err(|err| Error::Other(format!("failed to decode {}: {}", self.path.display(), err)))
    }
}

#[async_trait]
impl OperationsBackend for FileBackend {
    async fn get_operations(&self) -> Result<Vec<Operation>> {
        self.read().await
    }

    async fn get_last_operation(&self) -> Result<Operation> {
        let operations = self.read().await?;
        operations
            .into_iter()
            .max_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)))
            .ok_or_else(|| Error::NotFound(format!("no operation found in {}", self.path.display())))
    }
}
