//! Output sink for accepted records.

use std::io::{self, Write};

/// Destination of serialized records, one record per line.
///
/// Shared by all workers: a record must be written in one piece so lines
/// from different workers never interleave.
pub trait RecordSink: Send + Sync + 'static {
    /// Writes one serialized record followed by a newline.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the record could not be written.
    fn write_record(&self, record: &[u8]) -> io::Result<()>;
}

/// Writes records to standard output.
///
/// A write can fail after part of the line went out. Such a record is
/// written again in full on retry, so the reader may see a truncated line
/// followed by the complete one. A broken pipe is not retried.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl RecordSink for StdoutSink {
    fn write_record(&self, record: &[u8]) -> io::Result<()> {
        write_line(&mut io::stdout().lock(), record)
    }
}

/// Writes `record` and a newline with a single `write_all`, then flushes.
fn write_line(out: &mut impl Write, record: &[u8]) -> io::Result<()> {
    let mut line = Vec::with_capacity(record.len().saturating_add(1));
    line.extend_from_slice(record);
    line.push(b'\n');
    out.write_all(&line)?;
    out.flush()
}
