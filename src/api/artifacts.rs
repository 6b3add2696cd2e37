//! Request-scoped temporary files.
//!
//! Every video request gets its own directory. Dropping `RequestArtifacts`
//! removes it, so error paths and unwinding clean up without extra code.
//! A successful video download may hand the directory to a timer thread that
//! removes it after a grace period.

use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

pub(crate) struct RequestArtifacts {
    dir: TempDir,
}

impl RequestArtifacts {
    pub fn create(base: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("sentry-req-");
        let dir = match base {
            Some(base) => builder.tempdir_in(base)?,
            None => builder.tempdir()?,
        };
        Ok(Self { dir })
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.path().join(file_name)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the directory after `delay` on a background thread.
    pub fn release_after(self, delay: Duration) {
        let spawned = thread::Builder::new()
            .name("artifact-cleanup".into())
            .spawn(move || {
                thread::sleep(delay);
                self.release();
            });
        if let Err(err) = spawned {
            // The closure (and the directory) was dropped with the failed spawn.
            log::warn!("could not defer temp cleanup, removed immediately: {}", err);
        }
    }

    pub fn release(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(err) = self.dir.close() {
            log::warn!("failed to remove temp dir {}: {}", path.display(), err);
        }
    }
}

/// Keep only the final path component and characters that are safe in a
/// file name.
pub(crate) fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload.mp4".to_string()
    } else {
        cleaned
    }
}

/// `detected_<stem>.mp4` for the download name.
pub(crate) fn download_name(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("video");
    format!("detected_{stem}.mp4")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_and_release_remove_the_directory() {
        let base = tempfile::tempdir().unwrap();
        let artifacts = RequestArtifacts::create(Some(base.path())).unwrap();
        let root = artifacts.root().to_path_buf();
        std::fs::write(artifacts.path("input.mp4"), b"x").unwrap();
        drop(artifacts);
        assert!(!root.exists());

        let artifacts = RequestArtifacts::create(Some(base.path())).unwrap();
        let root = artifacts.root().to_path_buf();
        artifacts.release();
        assert!(!root.exists());
    }

    #[test]
    fn deferred_release_waits_then_removes() {
        let base = tempfile::tempdir().unwrap();
        let artifacts = RequestArtifacts::create(Some(base.path())).unwrap();
        let root = artifacts.root().to_path_buf();
        artifacts.release_after(Duration::from_millis(200));
        assert!(root.exists());
        for _ in 0..50 {
            if !root.exists() {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("temp dir {} was never removed", root.display());
    }

    #[test]
    fn file_names_are_reduced_to_a_safe_base_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\clips\\my clip.mov"), "myclip.mov");
        assert_eq!(sanitize_file_name(".."), "upload.mp4");
        assert_eq!(download_name("myclip.mov"), "detected_myclip.mp4");
    }
}
