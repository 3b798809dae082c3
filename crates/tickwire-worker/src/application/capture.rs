//! Scoped capture of procedure console output.
//!
//! The worker's stdout carries frames, so nothing a procedure prints may
//! reach it.  Two paths are covered:
//!
//! - **ambient output** (`println!`, [`io::stdout`]): the frame channel
//!   diverts the process's fd 1 when it opens
//!   ([`StdioChannel::open`](crate::infrastructure::stdio::StdioChannel::open)),
//!   and the guard flushes Rust's stdout buffer on entry and on drop, so a
//!   half-written line never outlives the invocation that produced it;
//! - **the [`Console`]** handed to each invocation through an
//!   [`OutputCapture`] guard, whose buffer is discarded when the guard drops.
//!
//! Both happen whether the procedure returned normally, failed, or panicked.

use std::io::{self, Write};

use tracing::debug;

/// Writable sink handed to a procedure for its diagnostic output.
#[derive(Debug, Default)]
pub struct Console {
    buf: Vec<u8>,
}

impl Console {
    /// Bytes written so far.
    pub fn contents(&self) -> &[u8] {
        &self.buf
    }
}

impl Write for Console {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// RAII guard owning the console of one invocation.
#[derive(Debug)]
pub struct OutputCapture {
    procedure: String,
    console: Console,
}

impl OutputCapture {
    /// Starts capturing for `procedure`.
    pub fn begin(procedure: &str) -> Self {
        let _ = io::stdout().flush();
        Self {
            procedure: procedure.to_string(),
            console: Console::default(),
        }
    }

    pub fn console(&mut self) -> &mut Console {
        &mut self.console
    }

    /// Number of bytes captured so far.
    fn captured_len(&self) -> usize {
        self.console.buf.len()
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        let _ = io::stdout().flush();
        let discarded = self.captured_len();
        if discarded > 0 {
            debug!(
                procedure = %self.procedure,
                discarded,
                "discarding captured procedure output"
            );
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_collects_writes() {
        // Arrange
        let mut capture = OutputCapture::begin("echo");

        // Act
        write!(capture.console(), "hello {}", 42).unwrap();
        writeln!(capture.console(), "!").unwrap();

        // Assert
        assert_eq!(capture.console().contents(), b"hello 42!\n");
        assert_eq!(capture.captured_len(), 10);
    }

    #[test]
    fn test_each_capture_starts_empty() {
        {
            let mut first = OutputCapture::begin("a");
            first.console().write_all(b"noise").unwrap();
        }
        let second = OutputCapture::begin("b");
        assert_eq!(second.captured_len(), 0);
    }

    #[test]
    fn test_capture_is_dropped_during_unwind() {
        let result = std::panic::catch_unwind(|| {
            let mut capture = OutputCapture::begin("boom");
            capture.console().write_all(b"partial").unwrap();
            panic!("procedure panicked");
        });
        assert!(result.is_err());
    }
}
