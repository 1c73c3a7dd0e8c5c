//! Post-build artifact auditing.
//!
//! After a build script populates its install prefix, the auditor walks the
//! tree and checks that what came out is actually usable on the target:
//! every compiled object matches the target platform, dynamic linkage is
//! relocatable, symlinks survive repacking, and x86-64 code does not exceed
//! the baseline instruction set. Defects the auditor knows how to repair
//! are fixed in place when autofix is enabled.
//!
//! There is no separate verbose switch: informational observations (such as
//! cpuid runtime dispatch) are always collected at [`Severity::Info`], which
//! never affects acceptance, and surface through the normal log filter at
//! info level while warnings and errors log at warn level.

pub mod finding;
pub mod isa;
pub mod linkage;
pub mod object;
pub mod symlinks;

use std::path::Path;
use tracing::{info, warn};

use crate::config::AuditConfig;
use crate::platform::{Arch, Platform};
use crate::products::Product;

pub use finding::{AuditFinding, FindingKind, Severity};
pub use object::{AuditError, BinaryFormat, ObjectFile};

/// The result of auditing one install prefix.
#[derive(Debug, Default)]
pub struct AuditReport {
    pub findings: Vec<AuditFinding>,
}

impl AuditReport {
    /// Whether the prefix is acceptable. Errors always reject; warnings
    /// reject only when the audit is configured as fatal.
    pub fn passed(&self, fatal: bool) -> bool {
        let threshold = if fatal {
            Severity::Warning
        } else {
            Severity::Error
        };
        !self
            .findings
            .iter()
            .any(|f| !f.fixed && f.severity >= threshold)
    }

    fn extend(&mut self, findings: Vec<AuditFinding>) {
        self.findings.extend(findings);
    }
}

/// Run every enabled audit pass over `prefix` for `platform`.
pub fn audit_prefix(
    prefix: &Path,
    platform: Platform,
    config: &AuditConfig,
) -> Result<AuditReport, AuditError> {
    let mut report = AuditReport::default();

    // Symlinks first: the object walk below must see the repaired tree.
    if config.check_symlinks {
        report.extend(symlinks::relativize_symlinks(prefix, config.autofix)?);
    }

    for path in symlinks::collect_regular_files(prefix)? {
        let rel = path.strip_prefix(prefix).unwrap_or(&path).to_path_buf();
        let Some(mut obj) = object::ObjectFile::load(&path)? else {
            continue;
        };

        if config.check_platform_match {
            let mismatches = platform_match(&obj, &rel, platform)?;
            if !mismatches.is_empty() {
                // A foreign binary's linkage and disassembly are meaningless.
                report.extend(mismatches);
                continue;
            }
        }

        if config.check_linkage {
            report.extend(linkage::check_linkage(&mut obj, &rel, config.autofix)?);
        }

        if config.check_instruction_set
            && platform.arch == Arch::X86_64
            && obj.format() == BinaryFormat::Elf
        {
            if let Some(isa_report) = isa::inspect(&path)? {
                if isa_report.generation > isa::IsaGeneration::Base {
                    let severity = if isa_report.uses_dispatch {
                        Severity::Info
                    } else {
                        Severity::Warning
                    };
                    let kind = if isa_report.uses_dispatch {
                        FindingKind::RuntimeDispatch
                    } else {
                        FindingKind::InstructionSetCeiling
                    };
                    report.findings.push(AuditFinding::new(
                        kind,
                        severity,
                        rel,
                        format!(
                            "requires the {} instruction set{}",
                            isa_report.generation.name(),
                            if isa_report.uses_dispatch {
                                " but appears to dispatch on cpuid"
                            } else {
                                ""
                            }
                        ),
                    ));
                }
            }
        }
    }

    for f in &report.findings {
        match f.severity {
            Severity::Error => warn!(%f, "audit error"),
            Severity::Warning => warn!(%f, "audit warning"),
            Severity::Info => info!(%f, "audit note"),
        }
    }

    Ok(report)
}

/// Check that every declared product resolves to a file in the prefix.
pub fn check_products(
    products: &[Product],
    prefix: &Path,
    platform: Platform,
) -> Vec<AuditFinding> {
    products
        .iter()
        .filter(|p| p.locate(prefix, platform).is_none())
        .map(|p| {
            AuditFinding::new(
                FindingKind::UnsatisfiedProduct,
                Severity::Error,
                prefix,
                format!(
                    "declared product '{}' has no matching file (expected e.g. {})",
                    p.name(),
                    p.expected_name(platform)
                ),
            )
        })
        .collect()
}

fn platform_match(
    obj: &ObjectFile,
    rel: &Path,
    platform: Platform,
) -> Result<Vec<AuditFinding>, AuditError> {
    let mut findings = Vec::new();

    let format_os = obj.format().os();
    if format_os != platform.os {
        findings.push(AuditFinding::new(
            FindingKind::PlatformMismatch,
            Severity::Error,
            rel,
            format!(
                "{:?} object in a {} prefix",
                obj.format(),
                platform.triplet()
            ),
        ));
        return Ok(findings);
    }

    match obj.arch()? {
        Some(arch) if arch == platform.arch => {}
        Some(arch) => findings.push(AuditFinding::new(
            FindingKind::PlatformMismatch,
            Severity::Error,
            rel,
            format!("compiled for {:?}, target is {:?}", arch, platform.arch),
        )),
        // Architectures we do not model (e.g. a stray RISC-V object) are
        // certainly not the target's.
        None => findings.push(AuditFinding::new(
            FindingKind::PlatformMismatch,
            Severity::Error,
            rel,
            "compiled for an unrecognized architecture",
        )),
    }

    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuditConfig;
    use tempfile::TempDir;

    fn default_config() -> AuditConfig {
        AuditConfig::default()
    }

    #[test]
    fn report_passed_thresholds() {
        let mut report = AuditReport::default();
        assert!(report.passed(false));
        assert!(report.passed(true));

        report.findings.push(AuditFinding::new(
            FindingKind::AbsoluteSymlink,
            Severity::Warning,
            "lib/x",
            "warn",
        ));
        assert!(report.passed(false));
        assert!(!report.passed(true));

        report.findings.push(AuditFinding::new(
            FindingKind::PlatformMismatch,
            Severity::Error,
            "lib/y",
            "error",
        ));
        assert!(!report.passed(false));
    }

    #[test]
    fn fixed_findings_do_not_reject() {
        let mut report = AuditReport::default();
        report.findings.push(
            AuditFinding::new(
                FindingKind::AbsoluteLinkage,
                Severity::Warning,
                "lib/x",
                "fixed up",
            )
            .autofixable()
            .mark_fixed(),
        );
        assert!(report.passed(true));
    }

    #[test]
    fn empty_prefix_audits_clean() {
        let prefix = TempDir::new().unwrap();
        std::fs::create_dir_all(prefix.path().join("lib")).unwrap();
        std::fs::write(prefix.path().join("lib/README"), "not a binary").unwrap();

        let platform = Platform::linux(crate::platform::Arch::X86_64);
        let report = audit_prefix(prefix.path(), platform, &default_config()).unwrap();
        assert!(report.findings.is_empty());
        assert!(report.passed(true));
    }
}
