//! Entry point for the re-exec'd sandbox child process.
//!
//! The parent re-executes the crossforge binary with
//! argv[0]="crossforge-sandbox" and a spec file path in argv[1]. Running the
//! setup in a fresh, single-threaded process matters: unshare(CLONE_NEWUSER)
//! fails in multithreaded processes, and the mounts created here live in the
//! child's mount namespace, so they vanish with the process on every exit
//! path — there is nothing to tear down on the host.
//!
//! Setup failures exit with code 125 to stay distinguishable from build
//! script exit codes.

use std::path::{Path, PathBuf};

use super::context::SandboxSpec;

/// Exit code for sandbox setup failures (as opposed to script failures).
pub const SETUP_FAILURE_CODE: i32 = 125;

/// Called when the binary detects argv[0] ends with "crossforge-sandbox".
/// Never returns — it either execs bash or exits.
pub fn sandbox_child_main() -> ! {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("crossforge-sandbox: expected a spec file argument");
        std::process::exit(SETUP_FAILURE_CODE);
    }

    let spec: SandboxSpec = match std::fs::read_to_string(&args[1])
        .map_err(|e| e.to_string())
        .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
    {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("crossforge-sandbox: failed to read spec {}: {}", args[1], e);
            std::process::exit(SETUP_FAILURE_CODE);
        }
    };

    if let Err(e) = setup_sandbox(&spec) {
        eprintln!("crossforge-sandbox: {}", e);
        std::process::exit(SETUP_FAILURE_CODE);
    }

    exec_bash(&spec);
}

/// One operation in the sandbox mount sequence.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
enum MountStep {
    Bind { source: PathBuf, target: PathBuf },
    LoopSquashfs { source: PathBuf, target: PathBuf },
    Proc { target: PathBuf },
    BindDev { target: PathBuf },
    RemountReadOnly { target: PathBuf },
}

/// Plan the mount sequence for one spec.
///
/// Ordering invariant: read-only remounts run last. Every mount target is
/// created with `create_dir_all` inside the rootfs tree, so the rootfs bind
/// must stay writable until the shard, workspace, proc and dev mountpoints
/// all exist; remounting it read-only up front makes those creations fail
/// with EROFS. Remounting the parent afterwards does not touch the child
/// mounts' own flags, so the workspace stays writable.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn plan_mounts(spec: &SandboxSpec) -> Vec<MountStep> {
    let mut steps = Vec::new();
    for mount in &spec.mounts {
        if mount.squashfs {
            steps.push(MountStep::LoopSquashfs {
                source: mount.source.clone(),
                target: mount.target.clone(),
            });
        } else {
            steps.push(MountStep::Bind {
                source: mount.source.clone(),
                target: mount.target.clone(),
            });
        }
    }
    steps.push(MountStep::Proc {
        target: spec.root.join("proc"),
    });
    steps.push(MountStep::BindDev {
        target: spec.root.join("dev"),
    });
    for mount in &spec.mounts {
        // Loop-mounted squashfs images are already mounted read-only.
        if !mount.writable && !mount.squashfs {
            steps.push(MountStep::RemountReadOnly {
                target: mount.target.clone(),
            });
        }
    }
    steps
}

#[cfg(target_os = "linux")]
fn setup_sandbox(spec: &SandboxSpec) -> Result<(), String> {
    use nix::sched::{unshare, CloneFlags};

    let uid = nix::unistd::getuid();
    let gid = nix::unistd::getgid();

    let mut flags = CloneFlags::CLONE_NEWNS;
    if !spec.privileged {
        flags |= CloneFlags::CLONE_NEWUSER;
    }
    unshare(flags).map_err(|e| format!("unshare failed: {}", e))?;

    if !spec.privileged {
        // Map ourselves to root inside the namespace. setgroups must be
        // denied before an unprivileged gid_map write is allowed.
        write_proc("/proc/self/setgroups", "deny")?;
        write_proc("/proc/self/uid_map", &format!("0 {} 1", uid))?;
        write_proc("/proc/self/gid_map", &format!("0 {} 1", gid))?;
    }

    // Stop mount events from propagating back to the host.
    mount_private_recursive()?;

    for step in plan_mounts(spec) {
        match step {
            MountStep::Bind { source, target } => bind_mount(&source, &target)?,
            MountStep::LoopSquashfs { source, target } => {
                loop_mount_squashfs(&source, &target, spec.privileged)?
            }
            MountStep::Proc { target } => mount_proc(&target)?,
            MountStep::BindDev { target } => bind_dev(&target)?,
            MountStep::RemountReadOnly { target } => remount_readonly(&target)?,
        }
    }

    nix::unistd::chroot(&spec.root).map_err(|e| format!("chroot failed: {}", e))?;
    std::env::set_current_dir(&spec.workdir)
        .map_err(|e| format!("chdir to {} failed: {}", spec.workdir.display(), e))?;

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn setup_sandbox(_spec: &SandboxSpec) -> Result<(), String> {
    Err("namespace sandboxing requires a Linux host".to_string())
}

#[cfg(target_os = "linux")]
fn bind_mount(source: &Path, target: &Path) -> Result<(), String> {
    use nix::mount::{mount as sys_mount, MsFlags};

    std::fs::create_dir_all(target)
        .map_err(|e| format!("creating mount target {}: {}", target.display(), e))?;
    sys_mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| {
        format!(
            "bind mount {} -> {} failed: {}",
            source.display(),
            target.display(),
            e
        )
    })
}

#[cfg(target_os = "linux")]
fn remount_readonly(target: &Path) -> Result<(), String> {
    use nix::mount::{mount as sys_mount, MsFlags};

    // Read-only for a bind mount takes a second remount call.
    sys_mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| format!("read-only remount of {} failed: {}", target.display(), e))
}

#[cfg(target_os = "linux")]
fn loop_mount_squashfs(source: &Path, target: &Path, privileged: bool) -> Result<(), String> {
    if !privileged {
        // Loop mounts are not permitted inside an unprivileged userns;
        // the backend should have provisioned the Archive encoding.
        return Err(format!(
            "cannot mount squashfs image {} without privilege",
            source.display()
        ));
    }
    std::fs::create_dir_all(target)
        .map_err(|e| format!("creating mount target {}: {}", target.display(), e))?;
    let status = std::process::Command::new("mount")
        .arg("-o")
        .arg("loop,ro")
        .arg(source)
        .arg(target)
        .status()
        .map_err(|e| format!("spawning mount: {}", e))?;
    if !status.success() {
        return Err(format!(
            "mounting squashfs {} failed with {}",
            source.display(),
            status
        ));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn mount_private_recursive() -> Result<(), String> {
    use nix::mount::{mount as sys_mount, MsFlags};
    sys_mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| format!("making mounts private failed: {}", e))
}

#[cfg(target_os = "linux")]
fn mount_proc(target: &Path) -> Result<(), String> {
    use nix::mount::{mount as sys_mount, MsFlags};
    std::fs::create_dir_all(target).map_err(|e| format!("creating {}: {}", target.display(), e))?;
    sys_mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| format!("mounting proc failed: {}", e))
}

#[cfg(target_os = "linux")]
fn bind_dev(target: &Path) -> Result<(), String> {
    use nix::mount::{mount as sys_mount, MsFlags};
    std::fs::create_dir_all(target).map_err(|e| format!("creating {}: {}", target.display(), e))?;
    sys_mount(
        Some("/dev"),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| format!("binding /dev failed: {}", e))
}

#[cfg(target_os = "linux")]
fn write_proc(path: &str, content: &str) -> Result<(), String> {
    std::fs::write(path, content).map_err(|e| format!("writing {}: {}", path, e))
}

/// Exec bash with a scrubbed environment, replacing the current process.
fn exec_bash(spec: &SandboxSpec) -> ! {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;

        let mut cmd = std::process::Command::new("/bin/bash");
        match &spec.command {
            Some(script) => {
                cmd.arg("-c").arg(script);
            }
            None => {
                // Interactive shell.
                cmd.arg("-i");
            }
        }
        cmd.env_clear().envs(&spec.env);

        let err = cmd.exec();
        // exec() only returns on error
        eprintln!("crossforge-sandbox: failed to exec bash: {}", err);
        std::process::exit(SETUP_FAILURE_CODE);
    }

    #[cfg(not(unix))]
    {
        let _ = spec;
        eprintln!("crossforge-sandbox: unsupported platform");
        std::process::exit(SETUP_FAILURE_CODE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::context::MountSpec;
    use std::collections::BTreeMap;

    fn spec() -> SandboxSpec {
        SandboxSpec {
            root: PathBuf::from("/stage/root"),
            mounts: vec![
                MountSpec {
                    source: PathBuf::from("/cache/rootfs"),
                    target: PathBuf::from("/stage/root"),
                    writable: false,
                    squashfs: false,
                },
                MountSpec {
                    source: PathBuf::from("/cache/shard"),
                    target: PathBuf::from("/stage/root/opt/aarch64-linux-gnu"),
                    writable: false,
                    squashfs: false,
                },
                MountSpec {
                    source: PathBuf::from("/ws"),
                    target: PathBuf::from("/stage/root/workspace"),
                    writable: true,
                    squashfs: false,
                },
            ],
            workdir: PathBuf::from("/workspace/srcdir"),
            env: BTreeMap::new(),
            privileged: false,
            command: None,
        }
    }

    #[test]
    fn readonly_remounts_run_after_every_mountpoint_exists() {
        // The rootfs lands read-write first; remounting it read-only before
        // the nested shard/workspace/proc/dev targets are created would make
        // their create_dir_all fail with EROFS.
        let steps = plan_mounts(&spec());
        let first_remount = steps
            .iter()
            .position(|s| matches!(s, MountStep::RemountReadOnly { .. }))
            .unwrap();
        let last_other = steps
            .iter()
            .rposition(|s| !matches!(s, MountStep::RemountReadOnly { .. }))
            .unwrap();
        assert!(first_remount > last_other);
    }

    #[test]
    fn readonly_mounts_are_all_remounted_and_writable_ones_never() {
        let steps = plan_mounts(&spec());
        let remounted: Vec<&PathBuf> = steps
            .iter()
            .filter_map(|s| match s {
                MountStep::RemountReadOnly { target } => Some(target),
                _ => None,
            })
            .collect();
        assert_eq!(
            remounted,
            vec![
                &PathBuf::from("/stage/root"),
                &PathBuf::from("/stage/root/opt/aarch64-linux-gnu"),
            ]
        );
    }

    #[test]
    fn proc_and_dev_mount_inside_the_composed_root() {
        let steps = plan_mounts(&spec());
        assert!(steps.contains(&MountStep::Proc {
            target: PathBuf::from("/stage/root/proc")
        }));
        assert!(steps.contains(&MountStep::BindDev {
            target: PathBuf::from("/stage/root/dev")
        }));
    }

    #[test]
    fn squashfs_images_loop_mount_without_a_remount() {
        let mut spec = spec();
        spec.privileged = true;
        spec.mounts[1].squashfs = true;
        let steps = plan_mounts(&spec);
        assert!(steps.contains(&MountStep::LoopSquashfs {
            source: PathBuf::from("/cache/shard"),
            target: PathBuf::from("/stage/root/opt/aarch64-linux-gnu"),
        }));
        // loop,ro covers it; only the rootfs bind still needs the remount.
        let remounts = steps
            .iter()
            .filter(|s| matches!(s, MountStep::RemountReadOnly { .. }))
            .count();
        assert_eq!(remounts, 1);
    }
}
