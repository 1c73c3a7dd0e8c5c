//! Symlink hygiene inside the install prefix.
//!
//! `ln -s $prefix/lib/libfoo.so ...` during a build produces a link whose
//! target names the sandbox path. Once the prefix is packaged and unpacked
//! elsewhere the link dangles. Any absolute link target that points back
//! into the prefix is rewritten as a relative one; absolute targets outside
//! the prefix are reported but left alone.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::finding::{AuditFinding, FindingKind, Severity};
use super::linkage::relative_walk;
use super::object::AuditError;

/// Walk the prefix and repair (or report) absolute symlinks.
pub fn relativize_symlinks(prefix: &Path, autofix: bool) -> Result<Vec<AuditFinding>, AuditError> {
    let mut findings = Vec::new();
    for link in walk(prefix, WalkKind::Symlinks)? {
        let target = fs::read_link(&link)?;
        if !target.is_absolute() {
            continue;
        }

        let rel_link = link.strip_prefix(prefix).unwrap_or(&link).to_path_buf();

        let Ok(inside) = target.strip_prefix(prefix) else {
            findings.push(AuditFinding::new(
                FindingKind::AbsoluteSymlink,
                Severity::Warning,
                rel_link,
                format!("symlink points outside the prefix: {}", target.display()),
            ));
            continue;
        };

        let from_dir = rel_link.parent().unwrap_or_else(|| Path::new(""));
        let new_target = relative_walk(from_dir, inside);

        let mut finding = AuditFinding::new(
            FindingKind::AbsoluteSymlink,
            Severity::Warning,
            rel_link.clone(),
            format!(
                "absolute symlink {} -> {}",
                target.display(),
                new_target.display()
            ),
        )
        .autofixable();

        if autofix {
            replace_symlink(&link, &new_target)?;
            debug!(link = %rel_link.display(), target = %new_target.display(), "relativized symlink");
            finding = finding.mark_fixed();
        }
        findings.push(finding);
    }
    Ok(findings)
}

/// All regular files under the prefix, for the object-level audit passes.
/// Symlinks are excluded so a file reachable by several names is audited
/// (and patched) exactly once.
pub fn collect_regular_files(prefix: &Path) -> Result<Vec<PathBuf>, AuditError> {
    let mut files = walk(prefix, WalkKind::RegularFiles)?;
    files.sort();
    Ok(files)
}

#[derive(Clone, Copy, PartialEq)]
enum WalkKind {
    RegularFiles,
    Symlinks,
}

fn walk(root: &Path, kind: WalkKind) -> Result<Vec<PathBuf>, AuditError> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            // symlink_metadata: a link to a directory must not be descended
            // into, and must be classified as a link.
            let meta = fs::symlink_metadata(&path)?;
            if meta.is_symlink() {
                if kind == WalkKind::Symlinks {
                    out.push(path);
                }
            } else if meta.is_dir() {
                stack.push(path);
            } else if meta.is_file() && kind == WalkKind::RegularFiles {
                out.push(path);
            }
        }
    }
    Ok(out)
}

#[cfg(unix)]
fn replace_symlink(link: &Path, target: &Path) -> Result<(), AuditError> {
    fs::remove_file(link)?;
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn replace_symlink(_link: &Path, _target: &Path) -> Result<(), AuditError> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn absolute_internal_symlink_is_relativized() {
        let prefix = TempDir::new().unwrap();
        touch(&prefix.path().join("lib/libfoo.so.1"));
        fs::create_dir_all(prefix.path().join("lib")).unwrap();
        symlink(
            prefix.path().join("lib/libfoo.so.1"),
            prefix.path().join("lib/libfoo.so"),
        )
        .unwrap();

        let findings = relativize_symlinks(prefix.path(), true).unwrap();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].fixed);

        let target = fs::read_link(prefix.path().join("lib/libfoo.so")).unwrap();
        assert_eq!(target, PathBuf::from("libfoo.so.1"));
        // The link still resolves.
        assert!(prefix.path().join("lib/libfoo.so").metadata().is_ok());
    }

    #[test]
    fn relative_symlinks_are_untouched() {
        let prefix = TempDir::new().unwrap();
        touch(&prefix.path().join("lib/libfoo.so.1"));
        symlink("libfoo.so.1", prefix.path().join("lib/libfoo.so")).unwrap();

        let findings = relativize_symlinks(prefix.path(), true).unwrap();
        assert!(findings.is_empty());
    }

    #[test]
    fn external_symlink_reported_not_fixed() {
        let prefix = TempDir::new().unwrap();
        fs::create_dir_all(prefix.path().join("etc")).unwrap();
        symlink("/etc/hosts", prefix.path().join("etc/hosts")).unwrap();

        let findings = relativize_symlinks(prefix.path(), true).unwrap();
        assert_eq!(findings.len(), 1);
        assert!(!findings[0].autofixable);
        assert!(!findings[0].fixed);
        // Target unchanged.
        let target = fs::read_link(prefix.path().join("etc/hosts")).unwrap();
        assert_eq!(target, PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn cross_directory_target() {
        let prefix = TempDir::new().unwrap();
        touch(&prefix.path().join("share/data.bin"));
        fs::create_dir_all(prefix.path().join("lib/pkg")).unwrap();
        symlink(
            prefix.path().join("share/data.bin"),
            prefix.path().join("lib/pkg/data.bin"),
        )
        .unwrap();

        relativize_symlinks(prefix.path(), true).unwrap();
        let target = fs::read_link(prefix.path().join("lib/pkg/data.bin")).unwrap();
        assert_eq!(target, PathBuf::from("../../share/data.bin"));
    }

    #[test]
    fn collect_skips_symlinks_and_dirs() {
        let prefix = TempDir::new().unwrap();
        touch(&prefix.path().join("bin/tool"));
        touch(&prefix.path().join("lib/libx.so.2"));
        symlink("libx.so.2", prefix.path().join("lib/libx.so")).unwrap();

        let files = collect_regular_files(prefix.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(prefix.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![PathBuf::from("bin/tool"), PathBuf::from("lib/libx.so.2")]
        );
    }
}
