use slipway_store::SiteLayout;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, error, info};

/// Filesystem operations used to stage and activate a build.
///
/// Activation goes through this capability rather than `std::fs` directly so
/// the pipeline can run against a filesystem that refuses writes.
pub trait SiteFs: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Fail if `dir` cannot be written to.
    fn check_writable(&self, dir: &Path) -> io::Result<()>;
}

/// The real local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl SiteFs for LocalFs {
    fn exists(&self, path: &Path) -> bool {
        path.symlink_metadata().is_ok()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn check_writable(&self, dir: &Path) -> io::Result<()> {
        tempfile::NamedTempFile::new_in(dir).map(drop)
    }
}

/// Whether `e` means the site cannot be written at all, as opposed to a
/// one-off failure.
pub fn is_unavailable(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::PermissionDenied || e.raw_os_error() == Some(libc::EROFS)
}

/// Replace any leftover tree at `staging` with a fresh empty directory.
pub fn prepare_staging(fs: &dyn SiteFs, staging: &Path) -> io::Result<()> {
    if fs.exists(staging) {
        fs.remove_dir_all(staging)?;
    }
    fs.create_dir_all(staging)
}

/// Swap `staging` in as the web root.
///
/// The current web root moves to `previous-wwwroot` first; if the second
/// rename fails it is moved back, so the site is never left without a web
/// root or with a partially replaced one.
pub fn activate(fs: &dyn SiteFs, staging: &Path, layout: &SiteLayout) -> io::Result<()> {
    let web_root = layout.web_root();
    let previous = layout.previous_web_root();

    fs.check_writable(layout.root())?;
    if fs.exists(&previous) {
        fs.remove_dir_all(&previous)?;
    }

    let had_web_root = fs.exists(&web_root);
    if had_web_root {
        fs.rename(&web_root, &previous)?;
    }

    if let Err(e) = fs.rename(staging, &web_root) {
        if had_web_root {
            if let Err(restore) = fs.rename(&previous, &web_root) {
                error!(
                    "failed to restore {} after activation error: {restore}",
                    web_root.display()
                );
            }
        }
        return Err(e);
    }

    info!("activated {}", web_root.display());
    Ok(())
}

/// Drop the previous web root once the new one is recorded as current.
pub fn confirm(fs: &dyn SiteFs, layout: &SiteLayout) -> io::Result<()> {
    let previous = layout.previous_web_root();
    if fs.exists(&previous) {
        debug!("removing {}", previous.display());
        fs.remove_dir_all(&previous)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn site() -> (tempfile::TempDir, SiteLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = SiteLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, layout)
    }

    fn stage(layout: &SiteLayout, content: &str) -> std::path::PathBuf {
        let staging = layout.staging_dir().join("build");
        prepare_staging(&LocalFs, &staging).unwrap();
        fs::write(staging.join("index.html"), content).unwrap();
        staging
    }

    /// Local filesystem whose n-th rename fails.
    struct FailingRename {
        fail_at: usize,
        calls: AtomicUsize,
    }

    impl SiteFs for FailingRename {
        fn exists(&self, path: &Path) -> bool {
            LocalFs.exists(path)
        }
        fn create_dir_all(&self, path: &Path) -> io::Result<()> {
            LocalFs.create_dir_all(path)
        }
        fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
            LocalFs.remove_dir_all(path)
        }
        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_at {
                return Err(io::Error::other("injected rename failure"));
            }
            LocalFs.rename(from, to)
        }
        fn check_writable(&self, dir: &Path) -> io::Result<()> {
            LocalFs.check_writable(dir)
        }
    }

    #[test]
    fn activation_swaps_and_keeps_previous_until_confirmed() {
        let (_dir, layout) = site();
        fs::write(layout.web_root().join("index.html"), "old").unwrap();
        let staging = stage(&layout, "new");

        activate(&LocalFs, &staging, &layout).unwrap();
        assert_eq!(
            fs::read_to_string(layout.web_root().join("index.html")).unwrap(),
            "new"
        );
        assert!(!staging.exists());
        assert_eq!(
            fs::read_to_string(layout.previous_web_root().join("index.html")).unwrap(),
            "old"
        );

        confirm(&LocalFs, &layout).unwrap();
        assert!(!layout.previous_web_root().exists());
    }

    #[test]
    fn failed_swap_restores_web_root() {
        let (_dir, layout) = site();
        fs::write(layout.web_root().join("index.html"), "old").unwrap();
        let staging = stage(&layout, "new");

        let fs_double = FailingRename {
            fail_at: 2,
            calls: AtomicUsize::new(0),
        };
        assert!(activate(&fs_double, &staging, &layout).is_err());
        assert_eq!(
            fs::read_to_string(layout.web_root().join("index.html")).unwrap(),
            "old"
        );
        assert!(staging.exists());
    }

    #[test]
    fn first_activation_without_web_root() {
        let (_dir, layout) = site();
        fs::remove_dir_all(layout.web_root()).unwrap();
        let staging = stage(&layout, "first");
        activate(&LocalFs, &staging, &layout).unwrap();
        assert!(layout.web_root().join("index.html").exists());
        assert!(!layout.previous_web_root().exists());
    }

    #[test]
    fn unavailable_classification() {
        assert!(is_unavailable(&io::Error::from_raw_os_error(libc::EROFS)));
        assert!(is_unavailable(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_unavailable(&io::Error::other("disk hiccup")));
    }
}
