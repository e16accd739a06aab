use std::convert::Infallible;
use std::ffi::CString;
use std::process::Command;

use nix::sched::CloneFlags;
use nix::sys::wait::WaitStatus;
use nix::unistd::chdir;
use nix::unistd::chroot;
use nix::unistd::execvp;
use nix::unistd::sethostname;

use crate::cgroup_preflight;
use crate::cleanup_container_root;
use crate::pipe_channel;
use crate::setup_cgroup;
use crate::setup_container_root;
use crate::setup_networking;
use crate::teardown_networking;
use crate::ContainerSpec;
use crate::Error;
use crate::PipeReceiver;
use crate::PipeSender;
use crate::Process;
use crate::Result;

const STACK_SIZE: usize = 1024 * 1024;
const CONTAINER_HOSTNAME: &str = "mocker";
/// Exit code of the child when its own setup fails before exec.
const CHILD_SETUP_FAILED: isize = 1;
/// Exit code of the child when exec of the user command fails.
const CHILD_EXEC_FAILED: isize = 127;

/// How a finished container run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerExit {
    /// The command exited on its own with this code.
    Exited(i32),
    /// The command was killed by this signal.
    Signaled(i32),
}

impl ContainerExit {
    /// Exit code for the calling shell: the child's own code, or the
    /// conventional 128+signal when it was killed.
    pub fn code(self) -> i32 {
        match self {
            ContainerExit::Exited(code) => code,
            ContainerExit::Signaled(signal) => 128 + signal,
        }
    }
}

/// Run a container to completion.
///
/// Validates the configuration, clones the child into fresh namespaces, attaches it to
/// its cgroup, provisions the network, waits for the child and finally tears
/// everything down in reverse creation order. Failure at any step kills the
/// child and unwinds whatever had been created by then.
///
/// Two pipe barriers order the work across the namespace boundary: the child
/// announces its root filesystem (so the parent provisions against a settled
/// container), and the parent announces the network (so the command cannot
/// start before its interfaces exist). Either side dying releases the other,
/// because a dead process closes its pipe ends.
pub fn run_container(spec: &ContainerSpec) -> Result<ContainerExit> {
    spec.validate()?;
    cgroup_preflight(spec)?;

    let (mut rootfs_tx, rootfs_rx) = pipe_channel().map_err(sync_error)?;
    let (mut net_tx, net_rx) = pipe_channel().map_err(sync_error)?;

    let flags = CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWNET;
    let mut child = Process::spawn(
        || child_main(spec, &mut rootfs_tx, &mut net_tx, &net_rx),
        STACK_SIZE,
        flags,
    )?;
    // The child signals on rootfs_tx; this copy of the write end must go so
    // the signal can arrive.
    rootfs_tx.close();

    let cgroup = match setup_cgroup(spec, child.id()) {
        Ok(handle) => handle,
        Err(e) => {
            child.kill();
            cleanup_container_root(&spec.container_root);
            return Err(e);
        }
    };

    if let Err(source) = rootfs_rx.wait_until_closed() {
        child.kill();
        cgroup.cleanup();
        cleanup_container_root(&spec.container_root);
        return Err(Error::Namespace {
            operation: "await container rootfs",
            source,
        });
    }

    if let Err(e) = setup_networking(spec, child.id()) {
        child.kill();
        cgroup.cleanup();
        cleanup_container_root(&spec.container_root);
        return Err(e);
    }
    // Release the child into exec now that its interfaces exist.
    net_tx.close();
    drop(net_rx);

    let status = child.wait();

    // Reverse creation order: NAT and veth, cgroup, rootfs. The child stack
    // goes last, with the process handle.
    teardown_networking(spec);
    cgroup.cleanup();
    cleanup_container_root(&spec.container_root);

    Ok(match status? {
        WaitStatus::Exited(_, code) => ContainerExit::Exited(code),
        WaitStatus::Signaled(_, signal, _) => ContainerExit::Signaled(signal as i32),
        other => {
            log::warn!("unexpected wait status {:?}", other);
            ContainerExit::Exited(1)
        }
    })
}

fn sync_error(source: std::io::Error) -> Error {
    Error::Namespace {
        operation: "create synchronization pipe",
        source,
    }
}

/// Entry point of the cloned child: a thin exit-code shim over
/// [`do_child_main`].
fn child_main(
    spec: &ContainerSpec,
    rootfs_ready: &mut PipeSender,
    net_tx: &mut PipeSender,
    net_ready: &PipeReceiver,
) -> isize {
    match do_child_main(spec, rootfs_ready, net_tx, net_ready) {
        Err(e @ Error::Exec { .. }) => {
            log::error!("{}", e);
            CHILD_EXEC_FAILED
        }
        Err(e) => {
            log::error!("container setup failed: {}", e);
            CHILD_SETUP_FAILED
        }
        Ok(never) => match never {},
    }
}

/// Prepare the container world and exec the user command.
///
/// Order matters: the hostname and rootfs exist before chroot; the readiness
/// signal fires after chroot so the parent provisions against the post-chroot
/// steady state; exec waits for the parent's network signal and never returns
/// on success.
fn do_child_main(
    spec: &ContainerSpec,
    rootfs_ready: &mut PipeSender,
    net_tx: &mut PipeSender,
    net_ready: &PipeReceiver,
) -> Result<Infallible> {
    // This process inherited a copy of the parent's network-ready sender;
    // holding it open would keep the wait below from ever finishing.
    net_tx.close();
    sethostname(CONTAINER_HOSTNAME).map_err(|errno| Error::Namespace {
        operation: "sethostname",
        source: errno.into(),
    })?;
    setup_container_root(&spec.container_root)?;
    chroot(&spec.container_root).map_err(|errno| Error::Filesystem {
        operation: "chroot to",
        path: spec.container_root.clone(),
        source: errno.into(),
    })?;
    chdir("/").map_err(|errno| Error::Filesystem {
        operation: "chdir to",
        path: "/".into(),
        source: errno.into(),
    })?;
    rootfs_ready.close();
    net_ready.wait_until_closed().map_err(|source| Error::Namespace {
        operation: "await network",
        source,
    })?;
    bring_up_loopback();
    exec_command(&spec.command)
}

/// Best-effort `lo` bring-up from inside the container.
///
/// The parent raises `lo` over netlink during provisioning; this shell-out
/// only helps on hosts where an `ip` applet survives the chroot, and a
/// failure here is expected otherwise.
fn bring_up_loopback() {
    match Command::new("ip").args(["link", "set", "lo", "up"]).status() {
        Ok(status) if status.success() => {}
        Ok(status) => log::debug!("ip link set lo up exited with {status}"),
        Err(e) => log::debug!("could not run ip: {e}"),
    }
}

fn exec_command(command: &[String]) -> Result<Infallible> {
    let argv = command
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| Error::Config("command contains an interior NUL byte".into()))?;
    let program = argv
        .first()
        .ok_or_else(|| Error::Config("no command to run".into()))?;
    log::debug!("executing {:?}", program);
    execvp(program, &argv).map_err(|errno| Error::Exec {
        command: command.join(" "),
        errno,
    })
}
