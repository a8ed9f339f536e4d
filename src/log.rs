//! Diagnostic logging that never allocates.
//!
//! Messages are formatted into a fixed stack buffer and written to stderr in one
//! `write(2)`. Output is gated by `SMALLOC_VERBOSE`; anything past the buffer is cut.

use core::fmt::{self, Write};

use crate::os;

const LINE_CAPACITY: usize = 256;
const PREFIX: &str = "[smalloc] ";

pub(crate) struct LineBuffer {
  buf: [u8; LINE_CAPACITY],
  len: usize,
  truncated: bool,
}

impl LineBuffer {
  pub(crate) const fn new() -> Self {
    Self {
      buf: [0; LINE_CAPACITY],
      len: 0,
      truncated: false,
    }
  }

  pub(crate) fn as_bytes(&self) -> &[u8] {
    &self.buf[..self.len]
  }

  /// Terminates the line, overwriting the tail with `...` if output was cut.
  fn finish(&mut self) {
    if self.truncated {
      self.len = LINE_CAPACITY - 4;
      self.buf[self.len..LINE_CAPACITY - 1].copy_from_slice(b"...");
      self.len = LINE_CAPACITY - 1;
    } else if self.len == LINE_CAPACITY {
      self.len -= 1;
    }
    self.buf[self.len] = b'\n';
    self.len += 1;
  }
}

impl Write for LineBuffer {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    let room = LINE_CAPACITY - self.len;
    let n = s.len().min(room);
    self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
    self.len += n;
    if n < s.len() {
      self.truncated = true;
    }
    Ok(())
  }
}

pub(crate) fn format_line(args: fmt::Arguments<'_>) -> LineBuffer {
  let mut line = LineBuffer::new();
  let _ = line.write_str(PREFIX);
  let _ = line.write_fmt(args);
  line.finish();
  line
}

#[cold]
pub(crate) fn emit(args: fmt::Arguments<'_>) {
  let line = format_line(args);
  os::write_stderr(line.as_bytes());
}

/// Logs a formatted line to stderr when verbose logging is enabled.
macro_rules! smalloc_log {
  ($($arg:tt)*) => {
    if $crate::config::verbose() {
      $crate::log::emit(format_args!($($arg)*));
    }
  };
}

pub(crate) use smalloc_log;
