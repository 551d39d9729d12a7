//! Fetching archive objects to local files before scanning.

use crate::WarcannonError;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// A fetched object on local disk. Temporary downloads are removed on drop.
#[derive(Debug)]
pub struct FetchedObject {
    path: PathBuf,
    temporary: bool,
}

impl FetchedObject {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FetchedObject {
    fn drop(&mut self) {
        if self.temporary {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "failed to remove scratch file");
                }
            }
        }
    }
}

pub trait ObjectFetcher: Send + Sync {
    fn fetch(&self, key: &str) -> Result<FetchedObject, WarcannonError>;
}

/// Serves keys from a local directory tree without copying.
pub struct LocalFetcher {
    root: PathBuf,
}

impl LocalFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ObjectFetcher for LocalFetcher {
    fn fetch(&self, key: &str) -> Result<FetchedObject, WarcannonError> {
        let path = self.root.join(key.trim_start_matches('/'));
        if !path.is_file() {
            return Err(WarcannonError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )));
        }
        Ok(FetchedObject { path, temporary: false })
    }
}

/// Copies objects with the `aws s3 cp` command into a scratch directory.
pub struct CliFetcher {
    program: String,
    bucket: String,
    scratch_dir: PathBuf,
}

impl CliFetcher {
    pub fn new(bucket: &str, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: "aws".to_string(),
            bucket: bucket.to_string(),
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Use a different executable with the same argument shape.
    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    pub fn scratch_path(&self, key: &str) -> PathBuf {
        self.scratch_dir.join(hex::encode(Sha256::digest(key.as_bytes())))
    }
}

impl ObjectFetcher for CliFetcher {
    fn fetch(&self, key: &str) -> Result<FetchedObject, WarcannonError> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        let target = self.scratch_path(key);
        let source = format!("s3://{}/{}", self.bucket, key.trim_start_matches('/'));
        debug!(%source, target = %target.display(), "copying object");

        // Owns the file from here so a failed copy cleans up its partial output.
        let object = FetchedObject { path: target, temporary: true };
        let output = Command::new(&self.program)
            .args(["s3", "cp", "--quiet", "--no-progress"])
            .arg(&source)
            .arg(object.path())
            .stdin(Stdio::null())
            .output()
            .map_err(|e| WarcannonError::Worker(format!("spawn {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(WarcannonError::Worker(format!(
                "copy of {} failed ({}): {}",
                source,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if !object.path().is_file() {
            return Err(WarcannonError::Worker(format!("copy of {} produced no file", source)));
        }
        Ok(object)
    }
}
