use crate::errors::{Result, SandboxError};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A per-execution scratch directory.
///
/// The dataset is staged into `input/` and the worker runs with the workspace
/// as its current directory, so relative paths a script might construct never
/// resolve into the host's own tree. The directory is removed on drop.
#[derive(Debug)]
pub struct IsolatedWorkspace {
    path: PathBuf,
}

impl IsolatedWorkspace {
    /// Create a new isolated workspace under `base`
    pub fn new(base: &Path) -> Result<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        let path = base.join(&id);
        std::fs::create_dir_all(path.join("input"))?;
        std::fs::create_dir_all(path.join("config"))?;

        info!("[SANDBOX] Created workspace: {:?}", path);

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the input directory path
    pub fn input_dir(&self) -> PathBuf {
        self.path.join("input")
    }

    /// Writable directory for library caches (matplotlib's font cache)
    pub fn config_dir(&self) -> PathBuf {
        self.path.join("config")
    }

    /// Copy `source` into the input directory, keeping its file name.
    ///
    /// The copy is marked read-only.
    pub fn stage_input(&self, source: &Path) -> Result<PathBuf> {
        let metadata = std::fs::metadata(source).map_err(|e| dataset_error(source, e))?;
        if !metadata.is_file() {
            return Err(dataset_error(
                source,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        let name = source
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "dataset".into());
        let dest = self.input_dir().join(name);
        std::fs::copy(source, &dest).map_err(|e| dataset_error(source, e))?;

        let mut permissions = std::fs::metadata(&dest)?.permissions();
        permissions.set_readonly(true);
        std::fs::set_permissions(&dest, permissions)?;

        info!("[SANDBOX] Staged dataset: {:?} -> {:?}", source, dest);
        Ok(dest)
    }
}

fn dataset_error(path: &Path, source: std::io::Error) -> SandboxError {
    SandboxError::DatasetUnavailable {
        path: path.to_path_buf(),
        source,
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(
                "[SANDBOX] Failed to cleanup workspace {:?}: {}",
                self.path, e
            );
        } else {
            info!("[SANDBOX] Cleaned up workspace: {:?}", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_input_copies_read_only() {
        let base = tempfile::tempdir().unwrap();
        let source_dir = tempfile::tempdir().unwrap();
        let source = source_dir.path().join("sales.csv");
        std::fs::write(&source, "region,sales\nnorth,10\n").unwrap();

        let workspace = IsolatedWorkspace::new(base.path()).unwrap();
        let staged = workspace.stage_input(&source).unwrap();

        assert_eq!(staged, workspace.input_dir().join("sales.csv"));
        assert_eq!(
            std::fs::read_to_string(&staged).unwrap(),
            "region,sales\nnorth,10\n"
        );
        assert!(std::fs::metadata(&staged).unwrap().permissions().readonly());
    }

    #[test]
    fn test_missing_dataset_is_reported() {
        let base = tempfile::tempdir().unwrap();
        let workspace = IsolatedWorkspace::new(base.path()).unwrap();

        let err = workspace
            .stage_input(Path::new("/definitely/not/here.csv"))
            .unwrap_err();
        assert!(matches!(err, SandboxError::DatasetUnavailable { .. }));

        let err = workspace.stage_input(base.path()).unwrap_err();
        assert!(matches!(err, SandboxError::DatasetUnavailable { .. }));
    }

    #[test]
    fn test_drop_removes_directory() {
        let base = tempfile::tempdir().unwrap();
        let workspace = IsolatedWorkspace::new(base.path()).unwrap();
        let path = workspace.path().to_path_buf();
        assert!(path.join("input").is_dir());

        drop(workspace);
        assert!(!path.exists());
        // Only the workspace itself goes; the shared base stays
        assert!(base.path().is_dir());
    }
}
