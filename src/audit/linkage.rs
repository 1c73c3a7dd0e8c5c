//! Relocatability audit for dynamic linkage.
//!
//! Build scripts routinely leave absolute build-time paths in DT_NEEDED
//! entries and Mach-O load commands (`/workspace/destdir/lib/libfoo.so`).
//! Those binaries only work in the sandbox. This pass rewrites such
//! references to loader-relative ones: `$ORIGIN/...` on ELF,
//! `@rpath/<name>` on Mach-O. PE carries bare DLL names only, so Windows
//! objects are never audited here.

use std::path::{Component, Path, PathBuf};
use tracing::debug;

use super::finding::{AuditFinding, FindingKind, Severity};
use super::object::{AuditError, BinaryFormat, ObjectFile};

/// Paths that mean "inside the install prefix" at build time. Scripts see
/// the prefix at this location inside the sandbox.
const BUILD_PREFIX: &str = "/workspace/destdir";

/// Audit one object's dynamic dependencies; repairs in place when `autofix`
/// is set. `rel_path` is the object's location relative to the prefix root.
pub fn check_linkage(
    object: &mut ObjectFile,
    rel_path: &Path,
    autofix: bool,
) -> Result<Vec<AuditFinding>, AuditError> {
    if object.format() == BinaryFormat::Pe {
        return Ok(Vec::new());
    }

    let mut findings = Vec::new();

    if object.format() == BinaryFormat::Elf && !object.is_relocatable_elf()? {
        findings.push(AuditFinding::new(
            FindingKind::AbsoluteLinkage,
            Severity::Warning,
            rel_path,
            "binary is not position independent and cannot be relocated",
        ));
    }

    let mut dirty = false;
    for dep in object.dynamic_deps()? {
        if !dep.starts_with('/') {
            continue;
        }

        let Some(inside) = strip_build_prefix(&dep) else {
            // Absolute, but not ours to fix: a path baked in from the host
            // or rootfs will not exist on end-user systems.
            findings.push(AuditFinding::new(
                FindingKind::AbsoluteLinkage,
                Severity::Warning,
                rel_path,
                format!("links against absolute path {}", dep),
            ));
            continue;
        };

        let replacement = match object.format() {
            BinaryFormat::Elf => elf_replacement(rel_path, &inside),
            BinaryFormat::MachO => macho_replacement(&inside),
            BinaryFormat::Pe => unreachable!("PE objects are filtered above"),
        };

        let mut finding = AuditFinding::new(
            FindingKind::AbsoluteLinkage,
            Severity::Warning,
            rel_path,
            format!("links against build-time path {} (-> {})", dep, replacement),
        )
        .autofixable();

        if autofix {
            match object.rewrite_dep(&dep, &replacement) {
                Ok(()) => {
                    debug!(dep, replacement, "rewrote dynamic dependency");
                    dirty = true;
                    finding = finding.mark_fixed();
                }
                Err(AuditError::ReplacementTooLong { .. }) => {
                    finding.autofixable = false;
                    finding.message.push_str(" [replacement does not fit]");
                }
                Err(e) => return Err(e),
            }
        }
        findings.push(finding);
    }

    if dirty {
        object.save()?;
    }
    Ok(findings)
}

/// Strip the sandbox install-prefix from an absolute dependency path.
fn strip_build_prefix(dep: &str) -> Option<PathBuf> {
    Path::new(dep)
        .strip_prefix(BUILD_PREFIX)
        .ok()
        .map(Path::to_path_buf)
}

/// ELF: `$ORIGIN/<walk from the object's directory to the dependency>`.
fn elf_replacement(object_rel: &Path, dep_rel: &Path) -> String {
    let from_dir = object_rel.parent().unwrap_or_else(|| Path::new(""));
    format!("$ORIGIN/{}", relative_walk(from_dir, dep_rel).display())
}

/// Mach-O: the loader resolves `@rpath` entries against LC_RPATH, which our
/// toolchain wrappers point at the library directories of the prefix.
fn macho_replacement(dep_rel: &Path) -> String {
    let name = dep_rel
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dep_rel.display().to_string());
    format!("@rpath/{}", name)
}

/// Relative path from `from_dir` to `to`, both prefix-relative.
pub(super) fn relative_walk(from_dir: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component> = from_dir.components().collect();
    let to_parts: Vec<Component> = to.components().collect();

    let common = from
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for part in &to_parts[common..] {
        rel.push(part);
    }
    rel
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_library_stays_flat() {
        assert_eq!(
            elf_replacement(Path::new("lib/libfoo.so"), Path::new("lib/libdep.so")),
            "$ORIGIN/libdep.so"
        );
    }

    #[test]
    fn cross_directory_walk() {
        assert_eq!(
            elf_replacement(
                Path::new("bin/tool"),
                Path::new("lib/plugins/libplug.so")
            ),
            "$ORIGIN/../lib/plugins/libplug.so"
        );
    }

    #[test]
    fn object_at_prefix_root() {
        assert_eq!(
            elf_replacement(Path::new("tool"), Path::new("lib/libdep.so")),
            "$ORIGIN/lib/libdep.so"
        );
    }

    #[test]
    fn macho_uses_rpath_and_basename() {
        assert_eq!(
            macho_replacement(Path::new("lib/libdep.1.dylib")),
            "@rpath/libdep.1.dylib"
        );
    }

    #[test]
    fn prefix_stripping() {
        assert_eq!(
            strip_build_prefix("/workspace/destdir/lib/liba.so"),
            Some(PathBuf::from("lib/liba.so"))
        );
        assert_eq!(strip_build_prefix("/usr/lib/libc.so.6"), None);
    }

    #[test]
    fn shorter_replacement_always_fits() {
        // The rewrite requires new <= old; for prefix paths the $ORIGIN form
        // is shorter whenever the dep shares the object's directory.
        let dep = format!("{}/lib/libdependency.so", BUILD_PREFIX);
        let replacement = elf_replacement(
            Path::new("lib/libuser.so"),
            &strip_build_prefix(&dep).unwrap(),
        );
        assert!(replacement.len() <= dep.len());
    }
}
