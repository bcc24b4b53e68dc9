//! Bounded line parsing over an async byte stream.
//!
//! Folds bare CR, bare LF, and CRLF to a single record boundary, including
//! a CRLF split across two reads. A line longer than the configured limit
//! is truncated to exactly the limit plus one `…` sentinel character; the
//! rest of the record is consumed and discarded so the boundary is kept.

use std::collections::VecDeque;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::charset::{Charset, Decoder};

/// Character appended to a truncated line in place of the discarded tail.
pub const TRUNCATION_MARK: char = '…';

const READ_CHUNK: usize = 4096;

/// Reads `\r`/`\n`/`\r\n`-delimited lines of at most `max_line_len`
/// characters from an async byte stream.
pub struct LineReader<R> {
    inner: R,
    decoder: Decoder,
    max_line_len: usize,
    chunk: Vec<u8>,
    /// Decoded characters not yet folded into lines.
    pending: VecDeque<char>,
    line: String,
    line_chars: usize,
    truncated: bool,
    /// A CR was just consumed; an immediately following LF is swallowed.
    swallow_lf: bool,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Create a reader yielding lines of at most `max_line_len` characters
    /// (must be at least 1).
    pub fn new(inner: R, max_line_len: usize, charset: Charset) -> Self {
        Self {
            inner,
            decoder: Decoder::new(charset),
            max_line_len: max_line_len.max(1),
            chunk: vec![0u8; READ_CHUNK],
            pending: VecDeque::new(),
            line: String::new(),
            line_chars: 0,
            truncated: false,
            swallow_lf: false,
            eof: false,
        }
    }

    /// Next line, `Ok(Some(""))` for an empty line, `Ok(None)` once the
    /// stream has ended with no pending characters.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            while let Some(c) = self.pending.pop_front() {
                if c == '\n' {
                    if self.swallow_lf {
                        self.swallow_lf = false;
                        continue;
                    }
                    return Ok(Some(self.take_line()));
                }
                self.swallow_lf = false;
                if c == '\r' {
                    self.swallow_lf = true;
                    return Ok(Some(self.take_line()));
                }
                if self.line_chars < self.max_line_len {
                    self.line.push(c);
                    self.line_chars += 1;
                } else if !self.truncated {
                    self.line.push(TRUNCATION_MARK);
                    self.truncated = true;
                }
                // Characters past the limit are discarded until the next
                // boundary.
            }

            if self.eof {
                if self.line_chars > 0 {
                    return Ok(Some(self.take_line()));
                }
                return Ok(None);
            }

            let mut decoded = String::new();
            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                self.eof = true;
                self.decoder.finish(&mut decoded)?;
            } else {
                self.decoder.decode(&self.chunk[..n], &mut decoded)?;
            }
            self.pending.extend(decoded.chars());
        }
    }

    /// Drain the stream, discarding every remaining line.
    pub async fn drain(&mut self) -> io::Result<()> {
        while self.next_line().await?.is_some() {}
        Ok(())
    }

    fn take_line(&mut self) -> String {
        self.line_chars = 0;
        self.truncated = false;
        std::mem::take(&mut self.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn lines_of(input: &[u8], max_len: usize) -> Vec<String> {
        let mut r = LineReader::new(input, max_len, Charset::Utf8Lossy);
        let mut out = Vec::new();
        while let Some(line) = r.next_line().await.unwrap() {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn test_lf_boundaries() {
        assert_eq!(lines_of(b"a\nb\nc\n", 80).await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_crlf_and_bare_cr_fold_to_one_boundary() {
        assert_eq!(lines_of(b"a\r\nb\rc\n", 80).await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_empty_lines_are_preserved() {
        assert_eq!(lines_of(b"a\n\nb\n", 80).await, vec!["a", "", "b"]);
    }

    #[tokio::test]
    async fn test_final_unterminated_line_is_yielded() {
        assert_eq!(lines_of(b"a\nlast", 80).await, vec!["a", "last"]);
    }

    #[tokio::test]
    async fn test_no_trailing_empty_line_after_terminator() {
        assert_eq!(lines_of(b"a\n", 80).await, vec!["a"]);
        assert!(lines_of(b"", 80).await.is_empty());
    }

    #[tokio::test]
    async fn test_overlong_line_truncated_to_len_plus_mark() {
        let out = lines_of(b"abcdefgh\nok\n", 4).await;
        assert_eq!(out, vec!["abcd…", "ok"]);
        assert_eq!(out[0].chars().count(), 5);
    }

    #[tokio::test]
    async fn test_crlf_split_across_reads() {
        // A 1-byte reader forces the CR and LF into separate reads.
        struct OneByte<'a>(&'a [u8]);
        impl tokio::io::AsyncRead for OneByte<'_> {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<io::Result<()>> {
                let data = self.0;
                if let Some((first, rest)) = data.split_first() {
                    buf.put_slice(&[*first]);
                    self.0 = rest;
                }
                std::task::Poll::Ready(Ok(()))
            }
        }
        let mut r = LineReader::new(OneByte(b"a\r\nb\n"), 80, Charset::Utf8Lossy);
        let mut out = Vec::new();
        while let Some(line) = r.next_line().await.unwrap() {
            out.push(line);
        }
        assert_eq!(out, vec!["a", "b"]);
    }
}
