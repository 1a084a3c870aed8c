use std::fs;
use std::io;
use std::path::Path;

/// Entries never copied into an artifact tree.
pub const EXCLUDED: &[&str] = &[".git", ".hg", ".deployment"];

/// Recursively copy `src` into `dst`, skipping source-control metadata and the
/// deployment file. Symlinks are recreated, not followed. Returns the number of
/// files and links copied.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if EXCLUDED.iter().any(|x| name == *x) {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        let ft = entry.file_type()?;
        if ft.is_dir() {
            copied += copy_tree(&from, &to)?;
        } else if ft.is_symlink() {
            let target = fs::read_link(&from)?;
            if to.symlink_metadata().is_ok() {
                fs::remove_file(&to)?;
            }
            std::os::unix::fs::symlink(target, &to)?;
            copied += 1;
        } else {
            fs::copy(&from, &to)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn copies_nested_tree_and_skips_metadata() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("css/theme")).unwrap();
        fs::create_dir_all(src.path().join(".git/objects")).unwrap();
        fs::write(src.path().join("index.html"), "<h1>hi</h1>").unwrap();
        fs::write(src.path().join("css/theme/site.css"), "body{}").unwrap();
        fs::write(src.path().join(".git/HEAD"), "ref").unwrap();
        fs::write(src.path().join(".deployment"), "[config]").unwrap();

        let out = dst.path().join("out");
        let n = copy_tree(src.path(), &out).unwrap();
        assert_eq!(n, 2);
        assert_eq!(
            fs::read_to_string(out.join("css/theme/site.css")).unwrap(),
            "body{}"
        );
        assert!(!out.join(".git").exists());
        assert!(!out.join(".deployment").exists());
    }

    #[test]
    fn preserves_symlinks_and_modes() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let script = src.path().join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("run.sh", src.path().join("start")).unwrap();

        copy_tree(src.path(), dst.path()).unwrap();
        let link = dst.path().join("start");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("run.sh"));
        let mode = fs::metadata(dst.path().join("run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
