use std::fs::File;

use nix::sched::setns;
use nix::sched::CloneFlags;
use nix::unistd::Pid;

use crate::Error;
use crate::Result;

/// Namespace kinds a cursor can enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsKind {
    /// Network namespace, `/proc/<pid>/ns/net`.
    Net,
}

impl NsKind {
    fn proc_name(self) -> &'static str {
        match self {
            NsKind::Net => "net",
        }
    }

    fn clone_flag(self) -> CloneFlags {
        match self {
            NsKind::Net => CloneFlags::CLONE_NEWNET,
        }
    }
}

/// Scoped entry into another process's namespace.
///
/// `enter` captures the caller's current namespace before switching, and the
/// cursor re-enters it when it goes out of scope, so no return path can leave
/// the caller stranded in the target namespace. Call
/// [`restore`](Self::restore) to surface a restoration error instead of
/// having it logged from the destructor.
pub struct NsCursor {
    saved: Option<File>,
    kind: NsKind,
}

impl NsCursor {
    /// Capture the current namespace of `kind`, then enter `pid`'s.
    pub fn enter(pid: Pid, kind: NsKind) -> Result<Self> {
        let saved = open_ns_handle("self", kind)?;
        let target = open_ns_handle(pid.as_raw(), kind)?;
        setns(&target, kind.clone_flag()).map_err(|errno| Error::Namespace {
            operation: "setns",
            source: errno.into(),
        })?;
        log::debug!("entered {} namespace of pid {}", kind.proc_name(), pid);
        Ok(Self {
            saved: Some(saved),
            kind,
        })
    }

    /// Re-enter the namespace captured at `enter` and release its handle.
    pub fn restore(mut self) -> Result<()> {
        self.switch_back()
    }

    fn switch_back(&mut self) -> Result<()> {
        let Some(saved) = self.saved.take() else {
            return Ok(());
        };
        setns(&saved, self.kind.clone_flag()).map_err(|errno| Error::Namespace {
            operation: "restore namespace",
            source: errno.into(),
        })
    }
}

impl Drop for NsCursor {
    fn drop(&mut self) {
        if let Err(e) = self.switch_back() {
            log::error!(
                "failed to restore the original {} namespace: {}",
                self.kind.proc_name(),
                e
            );
        }
    }
}

fn open_ns_handle(pid: impl std::fmt::Display, kind: NsKind) -> Result<File> {
    let path = format!("/proc/{}/ns/{}", pid, kind.proc_name());
    File::open(&path).map_err(|source| Error::Namespace {
        operation: "open namespace handle",
        source,
    })
}
