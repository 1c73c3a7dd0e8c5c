//! Cross-compilation environment composition.
//!
//! Build scripts stay target-agnostic: they invoke `gcc`, `make`, `ar` and
//! friends by their generic names, and the environment assembled here makes
//! those names resolve — inside the sandbox — to the correct cross tool for
//! the target. Per-target toolchains live under `/opt/<triplet>/bin`; a
//! target-agnostic "super" binutils set (objdump, readelf, nm for every
//! architecture) lives under `/opt/super/bin`.

use std::collections::BTreeMap;

use crate::platform::Platform;

/// Toolchain root for a target inside the sandbox.
pub fn toolchain_root(platform: Platform) -> String {
    format!("/opt/{}", platform.triplet())
}

/// Shared binary-inspection toolset path inside the sandbox.
pub const SUPER_BINUTILS_ROOT: &str = "/opt/super";

/// Derive the fixed variable set for a target.
///
/// Keys are stable API: build scripts and the auditor's objdump invocation
/// both rely on them.
pub fn compose_environment(platform: Platform, nproc: u32) -> BTreeMap<String, String> {
    let triplet = platform.triplet();
    let root = toolchain_root(platform);
    let tool = |name: &str| format!("{}/bin/{}-{}", root, triplet, name);

    let mut env = BTreeMap::new();
    env.insert("target".to_string(), triplet.clone());
    env.insert("CC".to_string(), tool("gcc"));
    env.insert("CXX".to_string(), tool("g++"));
    env.insert("FC".to_string(), tool("gfortran"));
    env.insert("LD".to_string(), tool("ld"));
    env.insert("AR".to_string(), tool("ar"));
    env.insert("AS".to_string(), tool("as"));
    env.insert("NM".to_string(), tool("nm"));
    env.insert("RANLIB".to_string(), tool("ranlib"));
    env.insert("STRIP".to_string(), tool("strip"));
    env.insert("OBJCOPY".to_string(), tool("objcopy"));

    // Generic tool names resolve through PATH: target toolchain first, then
    // the super binutils, then the rootfs base tools.
    env.insert(
        "PATH".to_string(),
        format!(
            "{root}/bin:{super_root}/bin:/usr/local/bin:/usr/bin:/bin",
            root = root,
            super_root = SUPER_BINUTILS_ROOT
        ),
    );

    env.insert("prefix".to_string(), "/workspace/destdir".to_string());
    env.insert("nproc".to_string(), nproc.to_string());
    env.insert("nbits".to_string(), platform.word_size().to_string());
    env.insert("proc_family".to_string(), platform.proc_family().to_string());

    env.insert("TERM".to_string(), "screen".to_string());
    env.insert("HISTFILE".to_string(), "/dev/null".to_string());

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Abi, Arch, Libc, Os};

    #[test]
    fn tools_are_triplet_qualified() {
        let env = compose_environment(Platform::linux(Arch::Aarch64), 8);
        assert_eq!(
            env.get("CC").unwrap(),
            "/opt/aarch64-linux-gnu/bin/aarch64-linux-gnu-gcc"
        );
        assert_eq!(
            env.get("AR").unwrap(),
            "/opt/aarch64-linux-gnu/bin/aarch64-linux-gnu-ar"
        );
        assert_eq!(env.get("target").unwrap(), "aarch64-linux-gnu");
    }

    #[test]
    fn path_prefers_target_toolchain_then_super() {
        let env = compose_environment(Platform::linux(Arch::X86_64), 1);
        let path = env.get("PATH").unwrap();
        let target_pos = path.find("/opt/x86_64-linux-gnu/bin").unwrap();
        let super_pos = path.find("/opt/super/bin").unwrap();
        assert!(target_pos < super_pos);
    }

    #[test]
    fn numeric_hints_follow_platform() {
        let env = compose_environment(
            Platform::new(Os::Linux, Arch::Armv7l, Libc::Glibc, Abi::Eabihf),
            6,
        );
        assert_eq!(env.get("nproc").unwrap(), "6");
        assert_eq!(env.get("nbits").unwrap(), "32");
        assert_eq!(env.get("proc_family").unwrap(), "arm");
        assert_eq!(env.get("prefix").unwrap(), "/workspace/destdir");
    }

    #[test]
    fn windows_targets_use_mingw_triplet() {
        let env = compose_environment(
            Platform::new(Os::Windows, Arch::X86_64, Libc::None, Abi::None),
            1,
        );
        assert_eq!(
            env.get("CC").unwrap(),
            "/opt/x86_64-w64-mingw32/bin/x86_64-w64-mingw32-gcc"
        );
    }
}
