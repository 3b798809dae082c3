//! Frame channel over a pair of non-blocking file descriptors, by default
//! the process's stdin and stdout.
//!
//! The descriptors are duplicated, so dropping the channel never closes the
//! process's own fd 0 / fd 1.  Both are switched to non-blocking mode, which
//! applies to the shared open file description: a parent that hands the
//! worker pipes is unaffected, but a terminal shared with stderr is not a
//! supported setup.
//!
//! Once the frame stream holds its own duplicate of stdout, the process's
//! fd 1 is pointed at `/dev/null`.  From then on `print!`, `println!` and
//! direct writes to [`io::stdout`] from procedure code are swallowed instead
//! of being spliced into the frame stream.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use tickwire_core::protocol::{FramedReader, FramedWriter};
use tracing::debug;

/// Reader and writer halves of the worker's frame channel.
#[derive(Debug)]
pub struct StdioChannel {
    reader: FramedReader<File>,
    writer: FramedWriter<File>,
}

impl StdioChannel {
    /// Opens the channel on duplicates of stdin and stdout, then diverts the
    /// process's stdout.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a descriptor cannot be duplicated or switched
    /// to non-blocking mode, or if stdout cannot be diverted.
    pub fn open() -> io::Result<Self> {
        let input = io::stdin().as_fd().try_clone_to_owned()?;
        Self::over_stdout(input)
    }

    /// Opens the channel reading from `input` and writing to a duplicate of
    /// the current stdout, which is then diverted to `/dev/null`.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn over_stdout(input: OwnedFd) -> io::Result<Self> {
        io::stdout().flush()?;
        let output = io::stdout().as_fd().try_clone_to_owned()?;
        let channel = Self::from_fds(input, output)?;
        divert_stdout()?;
        Ok(channel)
    }

    /// Opens the channel on arbitrary descriptors (pipes, socket pairs).
    ///
    /// # Errors
    ///
    /// Returns an I/O error if either descriptor cannot be made non-blocking.
    pub fn from_fds(input: OwnedFd, output: OwnedFd) -> io::Result<Self> {
        set_nonblocking(input.as_fd())?;
        set_nonblocking(output.as_fd())?;
        debug!(
            input = input.as_raw_fd(),
            output = output.as_raw_fd(),
            "frame channel opened"
        );
        Ok(Self {
            reader: FramedReader::new(File::from(input)),
            writer: FramedWriter::new(File::from(output)),
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.reader.get_ref().as_raw_fd()
    }

    pub fn write_fd(&self) -> RawFd {
        self.writer.get_ref().as_raw_fd()
    }

    /// Splits the channel into its parser and writer halves.  The descriptors
    /// stay open for as long as the halves live.
    pub fn into_parts(self) -> (FramedReader<File>, FramedWriter<File>) {
        (self.reader, self.writer)
    }
}

/// Points the process's fd 1 at `/dev/null`.
///
/// # Errors
///
/// Returns the error of opening `/dev/null` or of `dup2(2)`.
pub fn divert_stdout() -> io::Result<()> {
    let null = OpenOptions::new().write(true).open("/dev/null")?;

    // SAFETY: `null` is open for the whole call and fd 1 is replaced
    // atomically; no Rust object owns fd 1 exclusively.
    let rc = unsafe { libc::dup2(null.as_raw_fd(), libc::STDOUT_FILENO) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    debug!("process stdout diverted to /dev/null");
    Ok(())
}

/// Sets `O_NONBLOCK` on `fd`.
///
/// # Errors
///
/// Returns the `fcntl(2)` error.
pub fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let raw = fd.as_raw_fd();

    // SAFETY: `fd` is borrowed for the whole function, so `raw` is an open
    // descriptor; F_GETFL takes no pointer arguments.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }

    // SAFETY: as above; F_SETFL takes an integer flag argument.
    let rc = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
