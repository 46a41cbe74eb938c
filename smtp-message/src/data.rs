//! Dot-stuffing for the SMTP `DATA` body, shared between Qsmtpd (reading the
//! client's body) and Qremote (writing the body to the next hop).
//!
//! Grounded on `smtp-message/src/data/mod.rs`'s `EscapedDataReader`/
//! `DataUnescaper` state machine, simplified to operate line-by-line on top
//! of [`crate::CrlfLineReader`] rather than on a raw byte stream, since both
//! callers already go through that reader.

use crate::io::{CrlfLineReader, IoKind};
use futures::io::AsyncRead;

/// Reads body lines until the terminating `.` line, undoing dot-stuffing
/// (a line that starts with `..` on the wire is delivered as starting with
/// a single `.`). Returns `Ok(None)` once the terminator has been consumed.
pub struct DotStuffReader<'a, R> {
    inner: &'a mut CrlfLineReader<R>,
    finished: bool,
}

impl<'a, R> DotStuffReader<'a, R>
where
    R: Unpin + AsyncRead,
{
    pub fn new(inner: &'a mut CrlfLineReader<R>) -> DotStuffReader<'a, R> {
        DotStuffReader {
            inner,
            finished: false,
        }
    }

    /// Returns the next body line (without the trailing CRLF), or `None`
    /// once the `.` terminator has been read and consumed.
    pub async fn next_line(&mut self) -> Result<Option<Vec<u8>>, IoKind> {
        if self.finished {
            return Ok(None);
        }
        let line = self.inner.read_line().await?;
        let bytes = line.as_bytes();
        if bytes == b"." {
            self.finished = true;
            return Ok(None);
        }
        if !bytes.is_empty() && bytes[0] == b'.' {
            Ok(Some(bytes[1..].to_vec()))
        } else {
            Ok(Some(bytes.to_vec()))
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Dot-stuffs a body as it is written out: any line beginning with `.` gets
/// an extra leading `.`, and the stream is always terminated with a bare
/// `.` line.
pub struct DotStuffWriter {
    pending: Vec<u8>,
}

impl DotStuffWriter {
    pub fn new() -> DotStuffWriter {
        DotStuffWriter { pending: Vec::new() }
    }

    /// Feeds raw body bytes (which may split lines arbitrarily) and returns
    /// the dot-stuffed bytes ready to write to the wire (without the final
    /// terminator — call [`finish`](Self::finish) once the body is
    /// exhausted).
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::with_capacity(self.pending.len() + 8);
        let mut start = 0;
        while let Some(pos) = self.pending[start..]
            .windows(2)
            .position(|w| w == b"\r\n")
        {
            let line_end = start + pos + 2;
            let line = &self.pending[start..line_end];
            if line.first() == Some(&b'.') {
                out.push(b'.');
            }
            out.extend_from_slice(line);
            start = line_end;
        }
        self.pending.drain(..start);
        out
    }

    /// Flushes the final partial line (if the body didn't end in CRLF) and
    /// the terminating `.` line.
    pub fn finish(mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if !self.pending.is_empty() {
            if self.pending.first() == Some(&b'.') {
                out.push(b'.');
            }
            out.append(&mut self.pending);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b".\r\n");
        out
    }
}

impl Default for DotStuffWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_stuffs_leading_dot() {
        let mut w = DotStuffWriter::new();
        let mut out = w.feed(b".hello\r\nworld\r\n");
        out.extend(w.finish());
        assert_eq!(out, b"..hello\r\nworld\r\n.\r\n");
    }

    #[test]
    fn writer_terminates_mid_line_body() {
        let w = DotStuffWriter::new();
        assert_eq!(w.finish(), b".\r\n");
    }

    #[test]
    fn reader_unstuffs_and_detects_terminator() {
        smol::block_on(async {
            let mut cr = CrlfLineReader::new(futures::io::Cursor::new(
                b"..leading dot\r\nplain\r\n.\r\n".to_vec(),
            ));
            let mut r = DotStuffReader::new(&mut cr);
            assert_eq!(r.next_line().await.unwrap(), Some(b".leading dot".to_vec()));
            assert_eq!(r.next_line().await.unwrap(), Some(b"plain".to_vec()));
            assert_eq!(r.next_line().await.unwrap(), None);
            assert!(r.is_finished());
        });
    }
}
