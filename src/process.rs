use nix::sched::clone;
use nix::sched::CloneFlags;
use nix::sys::signal::kill;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::Error;
use crate::Result;

/// A child created with `clone(2)` and the stack it runs on.
///
/// The stack belongs to this handle and is released with it; the handle must
/// therefore outlive the child, which [`wait`](Self::wait) and
/// [`kill`](Self::kill) both guarantee by reaping before they return.
pub struct Process {
    pid: Pid,
    reaped: bool,
    _stack: Vec<u8>,
}

impl Process {
    /// Clone a child into the namespaces selected by `flags` and run `entry`
    /// on a fresh stack of `stack_size` bytes.
    pub fn spawn<F>(entry: F, stack_size: usize, flags: CloneFlags) -> Result<Self>
    where
        F: FnMut() -> isize,
    {
        let mut stack = vec![0_u8; stack_size];
        let mut entry = entry;
        // SAFETY: the child gets its own copy of the address space (no
        // CLONE_VM) and the stack stays alive in this handle until the child
        // has been reaped.
        let pid = unsafe { clone(Box::new(&mut entry), &mut stack, flags, Some(libc::SIGCHLD)) }
            .map_err(|errno| Error::Namespace {
                operation: "clone",
                source: errno.into(),
            })?;
        log::debug!("cloned child {}", pid);
        Ok(Self {
            pid,
            reaped: false,
            _stack: stack,
        })
    }

    /// Pid of the child.
    pub fn id(&self) -> Pid {
        self.pid
    }

    /// Block until the child exits and return how it went.
    pub fn wait(&mut self) -> Result<WaitStatus> {
        let status = waitpid(self.pid, None).map_err(|errno| Error::Namespace {
            operation: "waitpid",
            source: errno.into(),
        })?;
        self.reaped = true;
        Ok(status)
    }

    /// SIGKILL the child and reap it.
    ///
    /// This is the runtime's only kill path; failure branches all come
    /// through here so no component kills on its own.
    pub fn kill(&mut self) {
        if self.reaped {
            return;
        }
        if let Err(errno) = kill(self.pid, Signal::SIGKILL) {
            log::warn!("failed to kill child {}: {}", self.pid, errno);
        }
        match waitpid(self.pid, None) {
            Ok(_) => self.reaped = true,
            Err(errno) => log::warn!("failed to reap child {}: {}", self.pid, errno),
        }
    }
}
