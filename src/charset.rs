//! Character decoding for captured process output.
//!
//! Child processes produce bytes; the capture and line-reading layers turn
//! them into text. [`Charset::Utf8Lossy`] (the native default) substitutes
//! U+FFFD for invalid sequences, matching how interactive output is usually
//! displayed. [`Charset::Utf8`] is strict and surfaces invalid input as an
//! `InvalidData` I/O error, for callers that must not accept mangled text.
//!
//! Decoding is incremental: a multi-byte sequence split across two reads is
//! carried over and completed on the next chunk instead of being mangled.

use std::io;

/// How captured bytes are decoded into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    /// Strict UTF-8. Invalid input fails the read with `InvalidData`.
    Utf8,
    /// UTF-8 with U+FFFD replacement for invalid sequences (the default).
    #[default]
    Utf8Lossy,
}

/// Incremental decoder holding at most 3 carried-over bytes of an
/// incomplete trailing sequence.
pub(crate) struct Decoder {
    charset: Charset,
    carry: Vec<u8>,
}

impl Decoder {
    pub(crate) fn new(charset: Charset) -> Self {
        Self {
            charset,
            carry: Vec::new(),
        }
    }

    /// Decode `chunk` into `out`, carrying over any incomplete trailing
    /// sequence for the next call.
    pub(crate) fn decode(&mut self, chunk: &[u8], out: &mut String) -> io::Result<()> {
        // The carry is at most 3 bytes, so joining it with the chunk is a
        // small copy and only happens when a sequence straddled a read.
        let joined;
        let mut rest: &[u8] = if self.carry.is_empty() {
            chunk
        } else {
            let mut v = std::mem::take(&mut self.carry);
            v.extend_from_slice(chunk);
            joined = v;
            &joined
        };

        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // SAFETY: `valid_up_to` guarantees `valid` is UTF-8.
                    out.push_str(unsafe { std::str::from_utf8_unchecked(valid) });
                    match e.error_len() {
                        None => {
                            // Incomplete trailing sequence, finish it next call.
                            self.carry = after.to_vec();
                            break;
                        }
                        Some(bad) => match self.charset {
                            Charset::Utf8 => {
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    "invalid UTF-8 in process output",
                                ));
                            }
                            Charset::Utf8Lossy => {
                                out.push(char::REPLACEMENT_CHARACTER);
                                rest = &after[bad..];
                            }
                        },
                    }
                }
            }
        }
        Ok(())
    }

    /// Flush the decoder at end of stream. A dangling incomplete sequence is
    /// an error in strict mode and a single replacement char in lossy mode.
    pub(crate) fn finish(&mut self, out: &mut String) -> io::Result<()> {
        if self.carry.is_empty() {
            return Ok(());
        }
        self.carry.clear();
        match self.charset {
            Charset::Utf8 => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated UTF-8 sequence at end of process output",
            )),
            Charset::Utf8Lossy => {
                out.push(char::REPLACEMENT_CHARACTER);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(charset: Charset, chunks: &[&[u8]]) -> io::Result<String> {
        let mut d = Decoder::new(charset);
        let mut out = String::new();
        for c in chunks {
            d.decode(c, &mut out)?;
        }
        d.finish(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_ascii_passthrough() {
        assert_eq!(decode_all(Charset::Utf8, &[b"hello"]).unwrap(), "hello");
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        // U+00E9 is 0xC3 0xA9
        let out = decode_all(Charset::Utf8, &[b"caf\xC3", b"\xA9"]).unwrap();
        assert_eq!(out, "café");
    }

    #[test]
    fn test_lossy_replaces_invalid() {
        let out = decode_all(Charset::Utf8Lossy, &[b"a\xFFb"]).unwrap();
        assert_eq!(out, "a\u{FFFD}b");
    }

    #[test]
    fn test_strict_rejects_invalid() {
        assert!(decode_all(Charset::Utf8, &[b"a\xFFb"]).is_err());
    }

    #[test]
    fn test_dangling_sequence_at_eof() {
        assert!(decode_all(Charset::Utf8, &[b"ab\xC3"]).is_err());
        assert_eq!(
            decode_all(Charset::Utf8Lossy, &[b"ab\xC3"]).unwrap(),
            "ab\u{FFFD}"
        );
    }
}
