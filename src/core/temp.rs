//! Per-task temp file namespace.
//!
//! Names derive from the task's prefix, so concurrently running phases of
//! different tasks never collide, and a task finds its own files again in
//! a later phase.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct TempNamespace {
    dir: PathBuf,
    prefix: String,
}

impl TempNamespace {
    pub fn new(dir: PathBuf, prefix: &str) -> Self {
        Self {
            dir,
            prefix: escape(prefix),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Deterministic path `<dir>/<prefix><extra>.<ext>`. Nothing is created.
    pub fn path(&self, ext: &str, extra: &str) -> PathBuf {
        self.dir.join(format!("{}{}.{}", self.prefix, escape(extra), ext))
    }

    /// Create a new empty file in the namespace and return its path.
    ///
    /// The deterministic name is used when it is still free; otherwise a
    /// unique name with the same prefix and extension is generated. Files
    /// are kept on disk; removing them is up to the task.
    pub fn file(&self, ext: &str, extra: &str) -> io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;

        if !self.prefix.is_empty() {
            let candidate = self.path(ext, extra);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
            {
                Ok(_) => return Ok(candidate),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
        }

        let file = tempfile::Builder::new()
            .prefix(&format!("{}{}", self.prefix, escape(extra)))
            .suffix(&format!(".{}", ext))
            .tempfile_in(&self.dir)?;
        let (_, path) = file.keep().map_err(|e| e.error)?;
        Ok(path)
    }
}

fn escape(s: &str) -> String {
    s.replace(['/', ' '], "_")
}
