//! Compiled-object introspection.
//!
//! Wraps goblin's ELF/Mach-O/PE parsers behind one [`ObjectFile`] type the
//! audit passes share. The file's bytes are held in memory so linkage
//! repairs can patch string tables in place and write the result back.

use goblin::Object;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::platform::{Arch, Os};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed object {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: goblin::error::Error,
    },
    #[error("replacement '{new}' is longer than '{old}'; cannot patch in place")]
    ReplacementTooLong { old: String, new: String },
    #[error("dependency '{0}' not found in dynamic string table")]
    DependencyNotFound(String),
    #[error("in-place dependency rewrite is not supported for {0:?} objects")]
    RewriteUnsupported(BinaryFormat),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    Elf,
    MachO,
    Pe,
}

impl BinaryFormat {
    /// The OS whose loaders consume this container format.
    pub fn os(&self) -> Os {
        match self {
            BinaryFormat::Elf => Os::Linux,
            BinaryFormat::MachO => Os::Macos,
            BinaryFormat::Pe => Os::Windows,
        }
    }
}

/// A parsed compiled object, held in memory for inspection and patching.
pub struct ObjectFile {
    path: PathBuf,
    data: Vec<u8>,
    format: BinaryFormat,
}

impl ObjectFile {
    /// Load and classify a file. Returns `Ok(None)` for anything that is not
    /// an ELF, Mach-O or PE image (scripts, data files, static archives),
    /// which the auditor silently skips.
    pub fn load(path: &Path) -> Result<Option<ObjectFile>, AuditError> {
        let data = std::fs::read(path).map_err(|source| AuditError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let format = match Object::parse(&data) {
            Ok(Object::Elf(_)) => BinaryFormat::Elf,
            Ok(Object::Mach(goblin::mach::Mach::Binary(_))) => BinaryFormat::MachO,
            Ok(Object::PE(_)) => BinaryFormat::Pe,
            // Fat Mach-O binaries never come out of our toolchains; treat
            // them like every other unrecognized file.
            _ => return Ok(None),
        };

        Ok(Some(ObjectFile {
            path: path.to_path_buf(),
            data,
            format,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> BinaryFormat {
        self.format
    }

    /// The architecture the object was compiled for, if it is one we model.
    pub fn arch(&self) -> Result<Option<Arch>, AuditError> {
        let parsed = self.parse()?;
        Ok(match parsed {
            Object::Elf(elf) => {
                use goblin::elf::header::{EM_386, EM_AARCH64, EM_ARM, EM_PPC64, EM_X86_64};
                match elf.header.e_machine {
                    EM_X86_64 => Some(Arch::X86_64),
                    EM_386 => Some(Arch::I686),
                    EM_AARCH64 => Some(Arch::Aarch64),
                    EM_ARM => Some(Arch::Armv7l),
                    EM_PPC64 => Some(Arch::Ppc64le),
                    _ => None,
                }
            }
            Object::Mach(goblin::mach::Mach::Binary(macho)) => {
                use goblin::mach::cputype::{CPU_TYPE_ARM64, CPU_TYPE_X86_64};
                match macho.header.cputype {
                    CPU_TYPE_X86_64 => Some(Arch::X86_64),
                    CPU_TYPE_ARM64 => Some(Arch::Aarch64),
                    _ => None,
                }
            }
            Object::PE(pe) => {
                use goblin::pe::header::{COFF_MACHINE_X86, COFF_MACHINE_X86_64};
                match pe.header.coff_header.machine {
                    COFF_MACHINE_X86_64 => Some(Arch::X86_64),
                    COFF_MACHINE_X86 => Some(Arch::I686),
                    _ => None,
                }
            }
            _ => None,
        })
    }

    /// Names of the shared libraries the dynamic loader will resolve.
    pub fn dynamic_deps(&self) -> Result<Vec<String>, AuditError> {
        let parsed = self.parse()?;
        Ok(match parsed {
            Object::Elf(elf) => elf.libraries.iter().map(|s| s.to_string()).collect(),
            Object::Mach(goblin::mach::Mach::Binary(macho)) => macho
                .libs
                .iter()
                // goblin reports the object itself as the first "lib".
                .filter(|l| **l != "self")
                .map(|s| s.to_string())
                .collect(),
            Object::PE(pe) => pe
                .imports
                .iter()
                .map(|imp| imp.dll.to_string())
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect(),
            _ => Vec::new(),
        })
    }

    /// Whether the ELF object declares itself position independent (ET_DYN).
    /// Always true for the shared libraries and PIE executables our
    /// toolchains emit; a plain ET_EXEC binary cannot be relocated.
    pub fn is_relocatable_elf(&self) -> Result<bool, AuditError> {
        match self.parse()? {
            Object::Elf(elf) => Ok(elf.header.e_type == goblin::elf::header::ET_DYN),
            _ => Ok(true),
        }
    }

    /// Replace one dynamic dependency string with another, in place.
    ///
    /// The replacement must not be longer than the original: the string
    /// lives inside the object's string table and neighbouring entries
    /// cannot move. The remainder of the slot is NUL-filled.
    pub fn rewrite_dep(&mut self, old: &str, new: &str) -> Result<(), AuditError> {
        if new.len() > old.len() {
            return Err(AuditError::ReplacementTooLong {
                old: old.to_string(),
                new: new.to_string(),
            });
        }

        let range = match self.format {
            BinaryFormat::Elf => self.elf_strtab_range()?,
            // Mach-O dylib paths live in load commands near the file start.
            BinaryFormat::MachO => Some(0..self.data.len()),
            BinaryFormat::Pe => return Err(AuditError::RewriteUnsupported(self.format)),
        };
        let range = range.ok_or_else(|| AuditError::DependencyNotFound(old.to_string()))?;

        let offset = find_c_string(&self.data[range.clone()], old.as_bytes())
            .map(|pos| range.start + pos)
            .ok_or_else(|| AuditError::DependencyNotFound(old.to_string()))?;

        let slot = &mut self.data[offset..offset + old.len() + 1];
        slot.fill(0);
        slot[..new.len()].copy_from_slice(new.as_bytes());
        Ok(())
    }

    /// Persist patched bytes back to the original path.
    pub fn save(&self) -> Result<(), AuditError> {
        std::fs::write(&self.path, &self.data).map_err(|source| AuditError::Write {
            path: self.path.clone(),
            source,
        })
    }

    fn parse(&self) -> Result<Object<'_>, AuditError> {
        Object::parse(&self.data).map_err(|source| AuditError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Byte range of the `.dynstr` section, where DT_NEEDED strings live.
    fn elf_strtab_range(&self) -> Result<Option<std::ops::Range<usize>>, AuditError> {
        let elf = match self.parse()? {
            Object::Elf(elf) => elf,
            _ => return Ok(None),
        };
        for shdr in &elf.section_headers {
            if elf.shdr_strtab.get_at(shdr.sh_name) == Some(".dynstr") {
                let start = shdr.sh_offset as usize;
                let end = start.saturating_add(shdr.sh_size as usize);
                if end <= self.data.len() {
                    return Ok(Some(start..end));
                }
            }
        }
        Ok(None)
    }
}

/// Locate `needle` as a full NUL-terminated C string within `haystack`:
/// preceded by a NUL (or the buffer start) and followed by one. A bare
/// substring match would corrupt longer entries sharing a suffix.
fn find_c_string(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let mut start = 0;
    while start + needle.len() < haystack.len() {
        match haystack[start..]
            .windows(needle.len())
            .position(|w| w == needle)
        {
            Some(pos) => {
                let at = start + pos;
                let preceded = at == 0 || haystack[at - 1] == 0;
                let terminated = haystack.get(at + needle.len()) == Some(&0);
                if preceded && terminated {
                    return Some(at);
                }
                start = at + 1;
            }
            None => return None,
        }
    }
    None
}

#[cfg(test)]
impl ObjectFile {
    fn new_for_tests(path: PathBuf, data: Vec<u8>, format: BinaryFormat) -> Self {
        Self { path, data, format }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_string_matching_requires_both_boundaries() {
        let buf = b"\0libfoo.so\0xlibfoo.so\0libfoo.so.1\0";
        // Only the first entry is the exact string: the second has a
        // leading x, the third a trailing version suffix.
        assert_eq!(find_c_string(buf, b"libfoo.so"), Some(1));
        assert_eq!(find_c_string(buf, b"libbar.so"), None);
        assert_eq!(find_c_string(buf, b"libfoo.so.1"), Some(22));
    }

    #[test]
    fn c_string_match_at_buffer_start() {
        let buf = b"libz.so.1\0";
        assert_eq!(find_c_string(buf, b"libz.so.1"), Some(0));
    }

    #[test]
    fn rewrite_rejects_longer_replacement() {
        let mut obj = ObjectFile::new_for_tests(
            PathBuf::from("fake"),
            b"\0/a/b\0".to_vec(),
            BinaryFormat::MachO,
        );
        let err = obj.rewrite_dep("/a/b", "/longer/path").unwrap_err();
        assert!(matches!(err, AuditError::ReplacementTooLong { .. }));
    }

    #[test]
    fn rewrite_patches_in_place_with_nul_padding() {
        let mut obj = ObjectFile::new_for_tests(
            PathBuf::from("fake"),
            b"\0/workspace/destdir/lib/libdep.dylib\0next\0".to_vec(),
            BinaryFormat::MachO,
        );
        obj.rewrite_dep("/workspace/destdir/lib/libdep.dylib", "@rpath/libdep.dylib")
            .unwrap();
        assert_eq!(
            find_c_string(&obj.data, b"@rpath/libdep.dylib"),
            Some(1),
            "replacement should be terminated where it ends"
        );
        // The neighbouring string is untouched.
        assert!(find_c_string(&obj.data, b"next").is_some());
    }

    #[test]
    fn rewrite_unsupported_for_pe() {
        let mut obj =
            ObjectFile::new_for_tests(PathBuf::from("fake"), b"\0a.dll\0".to_vec(), BinaryFormat::Pe);
        let err = obj.rewrite_dep("a.dll", "b.dll").unwrap_err();
        assert!(matches!(err, AuditError::RewriteUnsupported(_)));
    }
}
