//! Persistent storage
//!
//! Locates the application data directory and persists engine settings.

use std::path::PathBuf;
use thiserror::Error;

pub mod settings;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read or write file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Get the application data directory
///
/// - Windows: `C:\Users\{user}\AppData\Roaming\llamalink\llamalink\data`
/// - macOS: `/Users/{user}/Library/Application Support/com.llamalink.llamalink`
/// - Linux: `/home/{user}/.local/share/llamalink`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "llamalink", "llamalink")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_names_application() {
        // Containers without a home directory have no data dir at all.
        if let Ok(path) = get_data_dir() {
            assert!(path.to_string_lossy().contains("llamalink"));
        }
    }
}
