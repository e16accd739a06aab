use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

/// Failure classes of the container runtime.
///
/// Every lifecycle step reports through one of these; the coordinator reacts
/// by unwinding whatever it had already created.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid invocation arguments or out-of-range limits. Reported before
    /// any side effect has taken place.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// `clone`, `setns` or `/proc/<pid>/ns/<kind>` failures, and the
    /// parent/child plumbing around them.
    #[error("{operation} failed: {source}")]
    Namespace {
        /// Which namespace operation failed.
        operation: &'static str,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The kernel rejected a netlink request.
    #[error("netlink {operation} failed: {errno}")]
    Netlink {
        /// Which provisioning operation the request belonged to.
        operation: &'static str,
        /// Errno reported in the NLMSG_ERROR payload.
        errno: Errno,
    },

    /// mount/mkdir/chroot failures while building or removing the container
    /// filesystem.
    #[error("{operation} {path:?} failed: {source}")]
    Filesystem {
        /// Which filesystem operation failed.
        operation: &'static str,
        /// Path it was applied to.
        path: PathBuf,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// Failures under `/sys/fs/cgroup`.
    #[error("cgroup {operation} at {path:?} failed: {source}")]
    Cgroup {
        /// Which cgroup file or directory operation failed.
        operation: &'static str,
        /// Path it was applied to.
        path: PathBuf,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The iptables helper failed. NAT is the one network operation delegated
    /// to an external command instead of spoken over netlink.
    #[error("iptables {operation} failed: {detail}")]
    Nat {
        /// Which NAT operation failed.
        operation: &'static str,
        /// Exit status or spawn error of the helper.
        detail: String,
    },

    /// `execvp` of the user command failed inside the container.
    #[error("failed to execute {command:?}: {errno}")]
    Exec {
        /// The command that could not be executed.
        command: String,
        /// Errno from `execvp`.
        errno: Errno,
    },
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;
