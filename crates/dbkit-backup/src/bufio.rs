//! Buffer sizing and batch-triggered flushing.

use std::io::{self, BufWriter, Write};

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * KIB;

/// Buffer for inputs under 1 MiB
pub const SMALL_BUFFER: usize = 64 * KIB;
/// Buffer for inputs under 100 MiB, and when the size is unknown
pub const DEFAULT_BUFFER: usize = MIB;
/// Buffer for inputs under 1 GiB
pub const LARGE_BUFFER: usize = 8 * MIB;
/// Buffer for anything larger
pub const HUGE_BUFFER: usize = 32 * MIB;

/// Picks a buffer size from the total input size.
pub fn buffer_size_for(total: Option<u64>) -> usize {
    match total {
        None => DEFAULT_BUFFER,
        Some(n) if n < MIB as u64 => SMALL_BUFFER,
        Some(n) if n < 100 * MIB as u64 => DEFAULT_BUFFER,
        Some(n) if n < 1024 * MIB as u64 => LARGE_BUFFER,
        Some(_) => HUGE_BUFFER,
    }
}

/// A buffered writer that also flushes once `threshold` bytes have been
/// written since the last flush, independent of its buffer capacity.
pub struct BatchWriter<W: Write> {
    inner: BufWriter<W>,
    threshold: usize,
    pending: usize,
    written: u64,
}

impl<W: Write> BatchWriter<W> {
    pub fn new(inner: W, buffer_size: usize, threshold: usize) -> Self {
        Self {
            inner: BufWriter::with_capacity(buffer_size.max(1), inner),
            threshold: threshold.max(1),
            pending: 0,
            written: 0,
        }
    }

    /// Total bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Bytes accepted since the last flush.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Flushes and returns the wrapped writer.
    pub fn into_inner(self) -> io::Result<W> {
        self.inner.into_inner().map_err(|e| e.into_error())
    }
}

impl<W: Write> Write for BatchWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.pending += n;
        self.written += n as u64;
        if self.pending >= self.threshold {
            self.flush()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()?;
        self.pending = 0;
        Ok(())
    }
}
