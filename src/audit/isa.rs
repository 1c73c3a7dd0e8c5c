//! x86-64 instruction-set ceiling classification.
//!
//! A binary built for the generic `x86_64-linux-gnu` target must run on any
//! x86-64 machine, but an over-eager `-march=native` leaves AVX or FMA
//! instructions behind. We disassemble with objdump, bucket every mnemonic
//! into the oldest microarchitecture generation that provides it, and report
//! the maximum. Binaries that execute `cpuid` are assumed to select code
//! paths at runtime, which downgrades the finding to informational.

use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::path::Path;
use std::process::Command;
use tracing::debug;

use super::object::AuditError;

/// Microarchitecture generations we distinguish, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IsaGeneration {
    /// Baseline x86-64 (SSE2).
    Base,
    /// SSE3/SSSE3/SSE4.
    Core2,
    /// AVX.
    SandyBridge,
    /// AVX2, FMA, BMI1/2.
    Haswell,
}

impl IsaGeneration {
    pub fn name(&self) -> &'static str {
        match self {
            IsaGeneration::Base => "x86_64",
            IsaGeneration::Core2 => "core2",
            IsaGeneration::SandyBridge => "sandybridge",
            IsaGeneration::Haswell => "haswell",
        }
    }
}

/// Outcome of scanning one binary's disassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsaReport {
    /// Newest generation any encountered instruction requires.
    pub generation: IsaGeneration,
    /// The binary queries cpuid, so it plausibly dispatches at runtime.
    pub uses_dispatch: bool,
}

static CORE2_MNEMONICS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // SSE3
        "addsubpd", "addsubps", "haddpd", "haddps", "hsubpd", "hsubps", "lddqu", "movddup",
        "movshdup", "movsldup",
        // SSSE3
        "pshufb", "phaddw", "phaddd", "phaddsw", "pmaddubsw", "phsubw", "phsubd", "phsubsw",
        "psignb", "psignw", "psignd", "pmulhrsw", "palignr", "pabsb", "pabsw", "pabsd",
        // SSE4.1/4.2
        "pmulld", "pmuldq", "ptest", "pblendvb", "blendps", "blendpd", "blendvps", "blendvpd",
        "roundps", "roundpd", "roundss", "roundsd", "pextrb", "pextrd", "pextrq", "pinsrb",
        "pinsrd", "pinsrq", "pmaxsb", "pmaxsd", "pminsb", "pminsd", "pcmpgtq", "pcmpestri",
        "pcmpestrm", "pcmpistri", "pcmpistrm", "popcnt", "crc32",
    ]
    .into_iter()
    .collect()
});

static SANDYBRIDGE_MNEMONICS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "vaddps", "vaddpd", "vaddss", "vaddsd", "vsubps", "vsubpd", "vmulps", "vmulpd",
        "vdivps", "vdivpd", "vsqrtps", "vsqrtpd", "vmovaps", "vmovapd", "vmovups", "vmovupd",
        "vmovss", "vmovsd", "vmovdqa", "vmovdqu", "vxorps", "vxorpd", "vandps", "vandpd",
        "vorps", "vorpd", "vmaxps", "vmaxpd", "vminps", "vminpd", "vcmpps", "vcmppd",
        "vshufps", "vshufpd", "vunpckhps", "vunpcklps", "vblendps", "vblendpd",
        "vbroadcastss", "vbroadcastsd", "vbroadcastf128", "vinsertf128", "vextractf128",
        "vpermilps", "vpermilpd", "vperm2f128", "vzeroupper", "vzeroall", "vmaskmovps",
        "vmaskmovpd", "vptest", "vroundps", "vroundpd",
    ]
    .into_iter()
    .collect()
});

static HASWELL_MNEMONICS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // AVX2
        "vpermd", "vpermq", "vpermps", "vpermpd", "vperm2i128", "vpbroadcastb", "vpbroadcastw",
        "vpbroadcastd", "vpbroadcastq", "vbroadcasti128", "vinserti128", "vextracti128",
        "vpsllvd", "vpsllvq", "vpsrlvd", "vpsrlvq", "vpsravd", "vpmaskmovd", "vpmaskmovq",
        "vgatherdps", "vgatherqps", "vgatherdpd", "vgatherqpd", "vpgatherdd", "vpgatherqd",
        "vpgatherdq", "vpgatherqq",
        // BMI1/2
        "andn", "bextr", "blsi", "blsmsk", "blsr", "bzhi", "mulx", "pdep", "pext", "rorx",
        "sarx", "shlx", "shrx", "tzcnt", "lzcnt",
    ]
    .into_iter()
    .collect()
});

/// Oldest generation that provides `mnemonic`.
fn generation_of(mnemonic: &str) -> IsaGeneration {
    // objdump suffixes lock prefixes etc. with spaces, so mnemonics arrive
    // clean; FMA has too many operand-order variants to enumerate.
    if mnemonic.starts_with("vfmadd")
        || mnemonic.starts_with("vfmsub")
        || mnemonic.starts_with("vfnmadd")
        || mnemonic.starts_with("vfnmsub")
    {
        return IsaGeneration::Haswell;
    }
    if HASWELL_MNEMONICS.contains(mnemonic) {
        IsaGeneration::Haswell
    } else if SANDYBRIDGE_MNEMONICS.contains(mnemonic) {
        IsaGeneration::SandyBridge
    } else if CORE2_MNEMONICS.contains(mnemonic) {
        IsaGeneration::Core2
    } else {
        IsaGeneration::Base
    }
}

/// Classify a stream of instruction mnemonics.
pub fn classify<'a>(mnemonics: impl IntoIterator<Item = &'a str>) -> IsaReport {
    let mut generation = IsaGeneration::Base;
    let mut uses_dispatch = false;
    for m in mnemonics {
        if m == "cpuid" {
            uses_dispatch = true;
            continue;
        }
        generation = generation.max(generation_of(m));
    }
    IsaReport {
        generation,
        uses_dispatch,
    }
}

/// Disassemble `path` and classify it. Returns `Ok(None)` when objdump is
/// unavailable or cannot read the file; the check is then skipped rather
/// than failing the audit.
pub fn inspect(path: &Path) -> Result<Option<IsaReport>, AuditError> {
    let output = match Command::new("objdump").arg("-d").arg(path).output() {
        Ok(o) => o,
        Err(e) => {
            debug!(error = %e, "objdump unavailable, skipping instruction-set check");
            return Ok(None);
        }
    };
    if !output.status.success() {
        debug!(path = %path.display(), "objdump could not disassemble");
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(Some(classify(parse_mnemonics(&text))))
}

/// Pull the mnemonic column out of objdump's disassembly listing. A code
/// line looks like `  401000:\t48 89 e5\tmov    %rsp,%rbp`.
fn parse_mnemonics(listing: &str) -> impl Iterator<Item = &str> {
    listing.lines().filter_map(|line| {
        let mut cols = line.split('\t');
        let addr = cols.next()?;
        if !addr.trim_end().ends_with(':') {
            return None;
        }
        let _bytes = cols.next()?;
        let insn = cols.next()?;
        let mnemonic = insn.split_whitespace().next()?;
        // Skip objdump's padding pseudo-ops.
        if mnemonic == "(bad)" || mnemonic.starts_with('.') {
            None
        } else {
            Some(mnemonic)
        }
    })
}
