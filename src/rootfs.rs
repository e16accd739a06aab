use std::fs;
use std::os::unix::fs::symlink;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::mount::mount;
use nix::mount::umount2;
use nix::mount::MntFlags;
use nix::mount::MsFlags;

use crate::Error;
use crate::Result;

const BUSYBOX: &str = "/bin/busybox";
const RESOLV_CONF: &str = "/etc/resolv.conf";
const SKELETON: &[&str] = &["bin", "proc", "sys", "dev", "etc", "tmp"];
/// Commands exposed inside the container, all symlinks to busybox.
const COMMANDS: &[&str] = &[
    "sh", "ls", "ps", "mount", "umount", "mkdir", "echo", "cat", "pwd",
];
/// (source, subdirectory, fstype) for the pseudo filesystems.
const PSEUDO_MOUNTS: &[(&str, &str, &str)] = &[
    ("proc", "proc", "proc"),
    ("sysfs", "sys", "sysfs"),
    ("devtmpfs", "dev", "devtmpfs"),
];

/// Build the container root filesystem at `root`.
///
/// Runs in the child, inside its fresh mount namespace, before chroot. The
/// pseudo-filesystem mounts are best effort: devtmpfs in particular is not
/// available inside nested containers.
pub fn setup_container_root(root: &Path) -> Result<()> {
    // The cloned mount namespace still shares propagation with the host
    // until marked private; without this the mounts below would leak out.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|errno| Error::Filesystem {
        operation: "make mounts private under",
        path: "/".into(),
        source: errno.into(),
    })?;

    remove_stale_root(root)?;
    create_skeleton(root)?;
    stage_busybox(root)?;
    mount_pseudo_filesystems(root);
    copy_resolv_conf(root)?;
    Ok(())
}

/// Parent-side teardown: lazily unmount the pseudo filesystems, then remove
/// the tree. Calling this for a root that is already gone is a no-op.
pub fn cleanup_container_root(root: &Path) {
    for (_, dir, _) in PSEUDO_MOUNTS.iter().rev() {
        let target = root.join(dir);
        if let Err(errno) = umount2(&target, MntFlags::MNT_DETACH) {
            log::debug!("unmount {}: {}", target.display(), errno);
        }
    }
    match fs::remove_dir_all(root) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("failed to remove {}: {}", root.display(), e),
    }
}

fn remove_stale_root(root: &Path) -> Result<()> {
    if root.exists() {
        log::debug!("removing stale container root {}", root.display());
        fs::remove_dir_all(root).map_err(|e| fs_error("remove stale root", root, e))?;
    }
    Ok(())
}

fn create_skeleton(root: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(0o755);
    builder.create(root).map_err(|e| fs_error("mkdir", root, e))?;
    for dir in SKELETON {
        let path = root.join(dir);
        builder
            .create(&path)
            .map_err(|e| fs_error("mkdir", &path, e))?;
    }
    Ok(())
}

/// Copy busybox into the root and link the command names at it.
fn stage_busybox(root: &Path) -> Result<()> {
    let target = root.join("bin/busybox");
    fs::copy(BUSYBOX, &target).map_err(|e| fs_error("copy busybox to", &target, e))?;
    fs::set_permissions(&target, fs::Permissions::from_mode(0o755))
        .map_err(|e| fs_error("chmod", &target, e))?;
    for command in COMMANDS {
        let link = root.join("bin").join(command);
        match symlink("busybox", &link) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => log::warn!("failed to link {}: {}", link.display(), e),
        }
    }
    Ok(())
}

fn mount_pseudo_filesystems(root: &Path) {
    for (source, dir, fstype) in PSEUDO_MOUNTS {
        let target = root.join(dir);
        log::debug!("mounting {} at {}", fstype, target.display());
        if let Err(errno) = mount(
            Some(*source),
            &target,
            Some(*fstype),
            MsFlags::empty(),
            None::<&str>,
        ) {
            log::warn!("could not mount {} at {}: {}", fstype, target.display(), errno);
        }
    }
}

/// Give the container the host's DNS configuration.
fn copy_resolv_conf(root: &Path) -> Result<()> {
    let target = root.join("etc/resolv.conf");
    fs::copy(RESOLV_CONF, &target).map_err(|e| fs_error("copy resolv.conf to", &target, e))?;
    Ok(())
}

fn fs_error(operation: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::Filesystem {
        operation,
        path: path.to_path_buf(),
        source,
    }
}
