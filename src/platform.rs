//! Canonical description of a build target and its compiler triplet.
//!
//! A [`Platform`] is an immutable value type (OS, CPU architecture, libc
//! variant, ABI tag) used as a map key throughout the crate. Every supported
//! platform serializes to a unique triplet string and parses back losslessly.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error returned when a triplet string cannot be parsed.
#[derive(Debug, Error)]
#[error("invalid platform triplet '{triplet}': {reason}")]
pub struct TripletError {
    pub triplet: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Linux,
    Windows,
    Macos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X86_64,
    I686,
    Aarch64,
    Armv7l,
    Ppc64le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Libc {
    Glibc,
    Musl,
    /// Windows and macOS targets carry no libc component in the triplet.
    None,
}

/// ABI tag carried by some triplets (hard-float ARM).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Abi {
    None,
    Eabihf,
}

/// A build target: OS + architecture + libc + ABI tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
    pub libc: Libc,
    pub abi: Abi,
}

impl Platform {
    pub const fn new(os: Os, arch: Arch, libc: Libc, abi: Abi) -> Self {
        Self {
            os,
            arch,
            libc,
            abi,
        }
    }

    /// Shorthand constructor for glibc Linux targets.
    pub const fn linux(arch: Arch) -> Self {
        Self::new(Os::Linux, arch, Libc::Glibc, Abi::None)
    }

    /// The fixed, versioned set of platforms we claim to fully support.
    ///
    /// The compiler shards technically contain a superset of this, but
    /// anything outside this list is unstable and not exercised by CI.
    pub fn supported() -> Vec<Platform> {
        vec![
            Platform::linux(Arch::X86_64),
            Platform::linux(Arch::I686),
            Platform::linux(Arch::Aarch64),
            Platform::new(Os::Linux, Arch::Armv7l, Libc::Glibc, Abi::Eabihf),
            Platform::linux(Arch::Ppc64le),
            Platform::new(Os::Linux, Arch::X86_64, Libc::Musl, Abi::None),
            Platform::new(Os::Linux, Arch::Aarch64, Libc::Musl, Abi::None),
            Platform::new(Os::Linux, Arch::Armv7l, Libc::Musl, Abi::Eabihf),
            Platform::new(Os::Windows, Arch::X86_64, Libc::None, Abi::None),
            Platform::new(Os::Windows, Arch::I686, Libc::None, Abi::None),
            Platform::new(Os::Macos, Arch::X86_64, Libc::None, Abi::None),
            Platform::new(Os::Macos, Arch::Aarch64, Libc::None, Abi::None),
        ]
    }

    /// The platform this binary itself was compiled for.
    ///
    /// crossforge only runs on Linux hosts, but the cfg-based derivation
    /// keeps tests honest on developer machines.
    pub fn host() -> Platform {
        let os = if cfg!(target_os = "macos") {
            Os::Macos
        } else if cfg!(target_os = "windows") {
            Os::Windows
        } else {
            Os::Linux
        };
        let arch = if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else if cfg!(target_arch = "x86") {
            Arch::I686
        } else {
            Arch::X86_64
        };
        let libc = match os {
            Os::Linux if cfg!(target_env = "musl") => Libc::Musl,
            Os::Linux => Libc::Glibc,
            _ => Libc::None,
        };
        Platform::new(os, arch, libc, Abi::None)
    }

    /// Render the canonical compiler triplet. Exact inverse of [`Platform::parse`].
    pub fn triplet(&self) -> String {
        let arch = match self.arch {
            Arch::X86_64 => "x86_64",
            Arch::I686 => "i686",
            Arch::Aarch64 => "aarch64",
            Arch::Armv7l => "armv7l",
            Arch::Ppc64le => "powerpc64le",
        };
        match self.os {
            Os::Linux => {
                let env = match (self.libc, self.abi) {
                    (Libc::Musl, Abi::Eabihf) => "musleabihf",
                    (Libc::Musl, Abi::None) => "musl",
                    (_, Abi::Eabihf) => "gnueabihf",
                    _ => "gnu",
                };
                format!("{}-linux-{}", arch, env)
            }
            Os::Windows => format!("{}-w64-mingw32", arch),
            Os::Macos => {
                // Darwin version is pinned per architecture: the oldest
                // deployment target each shard's SDK supports.
                let darwin = match self.arch {
                    Arch::Aarch64 => "darwin20",
                    _ => "darwin14",
                };
                format!("{}-apple-{}", arch, darwin)
            }
        }
    }

    /// Parse a compiler triplet back into a [`Platform`].
    pub fn parse(triplet: &str) -> Result<Platform, TripletError> {
        let err = |reason: &str| TripletError {
            triplet: triplet.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = triplet.splitn(3, '-');
        let arch_s = parts.next().ok_or_else(|| err("empty string"))?;
        let vendor_os = parts.next().ok_or_else(|| err("missing os component"))?;
        let rest = parts.next().unwrap_or("");

        let arch = match arch_s {
            "x86_64" => Arch::X86_64,
            "i686" => Arch::I686,
            "aarch64" => Arch::Aarch64,
            "armv7l" => Arch::Armv7l,
            "powerpc64le" => Arch::Ppc64le,
            other => return Err(err(&format!("unknown architecture '{}'", other))),
        };

        match vendor_os {
            "linux" => {
                let (libc, abi) = match rest {
                    "gnu" => (Libc::Glibc, Abi::None),
                    "gnueabihf" => (Libc::Glibc, Abi::Eabihf),
                    "musl" => (Libc::Musl, Abi::None),
                    "musleabihf" => (Libc::Musl, Abi::Eabihf),
                    other => return Err(err(&format!("unknown linux environment '{}'", other))),
                };
                Ok(Platform::new(Os::Linux, arch, libc, abi))
            }
            "w64" => {
                if rest != "mingw32" {
                    return Err(err("windows triplets must end in -w64-mingw32"));
                }
                Ok(Platform::new(Os::Windows, arch, Libc::None, Abi::None))
            }
            "apple" => {
                if !rest.starts_with("darwin") {
                    return Err(err("apple triplets must end in -apple-darwinNN"));
                }
                Ok(Platform::new(Os::Macos, arch, Libc::None, Abi::None))
            }
            other => return Err(err(&format!("unknown os/vendor component '{}'", other))),
        }
    }

    /// Pointer width in bits, exposed to build scripts as `nbits`.
    pub fn word_size(&self) -> u32 {
        match self.arch {
            Arch::I686 | Arch::Armv7l => 32,
            _ => 64,
        }
    }

    /// Coarse processor family, exposed to build scripts as `proc_family`.
    pub fn proc_family(&self) -> &'static str {
        match self.arch {
            Arch::X86_64 | Arch::I686 => "intel",
            Arch::Aarch64 | Arch::Armv7l => "arm",
            Arch::Ppc64le => "power",
        }
    }

    /// Shared library extension on this platform.
    pub fn dlext(&self) -> &'static str {
        match self.os {
            Os::Linux => "so",
            Os::Windows => "dll",
            Os::Macos => "dylib",
        }
    }

    /// Executable suffix on this platform ("" everywhere but Windows).
    pub fn exeext(&self) -> &'static str {
        match self.os {
            Os::Windows => ".exe",
            _ => "",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.triplet())
    }
}

impl std::str::FromStr for Platform {
    type Err = TripletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::parse(s)
    }
}

/// Rank a set of platforms into the deterministic order builds run in.
///
/// The first-ranked platform is used to validate a build before the rest are
/// attempted, so the ranking is load-bearing: host platform first if present,
/// then OS order {linux, windows, macos}, then architecture order
/// {x86_64, i686, aarch64, ppc64le, armv7l}, ties broken by input order.
pub fn preferred_order(platforms: &[Platform]) -> Vec<Platform> {
    let host = Platform::host();

    fn os_rank(os: Os) -> u8 {
        match os {
            Os::Linux => 0,
            Os::Windows => 1,
            Os::Macos => 2,
        }
    }
    fn arch_rank(arch: Arch) -> u8 {
        match arch {
            Arch::X86_64 => 0,
            Arch::I686 => 1,
            Arch::Aarch64 => 2,
            Arch::Ppc64le => 3,
            Arch::Armv7l => 4,
        }
    }

    let mut ranked: Vec<Platform> = platforms.to_vec();
    // Stable sort preserves input order for ties.
    ranked.sort_by_key(|p| {
        let host_key = if *p == host { 0u8 } else { 1 };
        (host_key, os_rank(p.os), arch_rank(p.arch))
    });
    ranked
}
