use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

use crate::error::CoreError;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A downloaded blob written to the worker's scratch directory under a
/// monotonically-unique filename (§4.2 step 2). Deleted on drop regardless
/// of how the pipeline finishes -- success, recorded failure, or a panic
/// unwinding through the call -- so no job ever leaks a scratch file (§4.2
/// step 8, §9 "per-worker scratch directories").
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn write(dir: &Path, job_id: Uuid, bytes: &[u8]) -> Result<Self, CoreError> {
        let suffix = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("{job_id}-{suffix}.pdf"));
        std::fs::write(&path, bytes).map_err(|e| CoreError::Storage(format!("failed to write scratch file {}: {e}", path.display())))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to delete scratch file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_creates_file_and_drop_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let job_id = Uuid::new_v4();
        let path = {
            let scratch = ScratchFile::write(dir.path(), job_id, b"%PDF-1.4 fake").unwrap();
            let path = scratch.path().to_path_buf();
            assert!(path.exists());
            assert_eq!(std::fs::read(&path).unwrap(), b"%PDF-1.4 fake");
            path
        };
        assert!(!path.exists());
    }

    #[test]
    fn two_writes_for_the_same_job_get_distinct_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let job_id = Uuid::new_v4();
        let a = ScratchFile::write(dir.path(), job_id, b"a").unwrap();
        let b = ScratchFile::write(dir.path(), job_id, b"b").unwrap();
        assert_ne!(a.path(), b.path());
    }
}
