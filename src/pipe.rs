use std::fs::File;
use std::io::Read;
use std::os::fd::OwnedFd;

use nix::fcntl::OFlag;
use nix::unistd::pipe2;

/// Create a close-to-signal channel between parent and child.
///
/// The signal is the disappearance of the write end: `wait_until_closed`
/// returns once every copy of it is gone. Because a dying process closes its
/// descriptors, the waiter also wakes when the sender crashes, so there is no
/// way to hang on a dead peer. The descriptors are close-on-exec; an exec on
/// the sending side releases the signal as well.
pub fn pipe_channel() -> std::io::Result<(PipeSender, PipeReceiver)> {
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;
    Ok((
        PipeSender {
            fd: Some(write_end),
        },
        PipeReceiver {
            file: File::from(read_end),
        },
    ))
}

/// Write end of the channel. Closing it releases every waiter.
pub struct PipeSender {
    fd: Option<OwnedFd>,
}

impl PipeSender {
    /// Signal by closing this copy of the write end. Idempotent.
    ///
    /// After a `clone` both processes hold a copy; each side must close its
    /// own for the receiver to see end-of-file.
    pub fn close(&mut self) {
        self.fd.take();
    }
}

/// Read end of the channel.
pub struct PipeReceiver {
    file: File,
}

impl PipeReceiver {
    /// Block until the write end is fully closed.
    pub fn wait_until_closed(&self) -> std::io::Result<()> {
        let mut file = &self.file;
        let mut buf = [0_u8; 1];
        loop {
            match file.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
