//! Per-run scratch directories.
//!
//! Every execution gets a fresh directory that is the program's working
//! directory, `HOME` and `TMPDIR`. Nothing is shared between runs and the
//! directory is removed when the workspace is dropped.

use crate::errors::Result;
use crate::types::ExecutionId;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// An isolated scratch directory for one execution
pub struct ScratchWorkspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl ScratchWorkspace {
    /// Create a new workspace under `base`
    pub fn new(base: &Path, id: ExecutionId) -> Result<Self> {
        std::fs::create_dir_all(base)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("exec-{}-", id))
            .tempdir_in(base)?;
        let path = dir.path().to_path_buf();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
        }

        debug!("[SANDBOX] Created workspace: {:?}", path);

        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the submitted program into the workspace
    pub fn write_program(&self, file_name: &str, source: &str) -> Result<PathBuf> {
        let dest = self.path.join(file_name);
        std::fs::write(&dest, source)?;
        Ok(dest)
    }

    /// Names of the files directly inside the workspace
    #[cfg(test)]
    fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                files.push(name.to_string());
            }
        }
        files.sort();
        Ok(files)
    }
}

impl Drop for ScratchWorkspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!(
                    "[SANDBOX] Failed to cleanup workspace {:?}: {}",
                    self.path, e
                );
            } else {
                debug!("[SANDBOX] Cleaned up workspace: {:?}", self.path);
            }
        }
    }
}
