use std::cmp;
use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Maximum length of a command line, including the `<CR><LF>` terminator.
const MAX_COMMAND_LINE_LENGTH: usize = 255;

/// Enumeration of errors that can occur while framing session input.
#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("maximum command line length exceeded")]
    CommandLineTooLong,
    #[error(transparent)]
    IoError(#[from] io::Error),
}

/// A decoded unit of session input.
#[derive(Debug)]
pub enum Frame {
    /// One command line, terminators stripped.
    Line(String),
    /// Raw feed bytes (after the session switched to feed mode).
    Feed(Bytes),
}

/// A [`Decoder`] that splits session input into command lines until the
/// session switches to feed mode, after which raw byte chunks are passed
/// through for reassembly.
///
/// Note that SeedLink commands consist of an ASCII string followed by zero
/// or more arguments separated by spaces and terminated with carriage return
/// (`\r`, ASCII code 13) followed by linefeed (`\n`, ASCII code 10). The
/// codec also accepts a single `<CR>` or `<LF>` as a command terminator.
/// Empty command lines are ignored.
///
/// `decode` returns a `ParseError` when a line exceeds the length limit;
/// the session terminates the connection in that case.
#[derive(Debug, Default)]
pub struct SessionCodec {
    next_index: usize,
    is_discarding: bool,
    feed: bool,
}

impl SessionCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches the codec to feed (binary) mode.
    pub fn set_feed(&mut self) {
        self.feed = true;
        self.next_index = 0;
    }
}

impl Decoder for SessionCodec {
    type Item = Frame;
    type Error = ParseError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ParseError> {
        if self.feed {
            if buf.is_empty() {
                return Ok(None);
            }
            return Ok(Some(Frame::Feed(buf.split_to(buf.len()).freeze())));
        }

        loop {
            let read_to = cmp::min(MAX_COMMAND_LINE_LENGTH, buf.len());

            let newline_offset = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n' || *b == b'\r');

            match (self.is_discarding, newline_offset) {
                (true, Some(offset)) => {
                    buf.advance(offset + self.next_index + 1);
                    self.is_discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let mut newline_index = offset + self.next_index;
                    // handle <CR><LF>
                    if b'\r' == buf[newline_index]
                        && newline_index + 1 < buf.len()
                        && b'\n' == buf[newline_index + 1]
                    {
                        newline_index += 1;
                    }

                    self.next_index = 0;
                    let line = buf.split_to(newline_index + 1);
                    let line = &line[..line.len() - 1];
                    let line = without_carriage_return(line);
                    if line.is_empty() {
                        // ignore empty command lines
                        continue;
                    }

                    let line = String::from_utf8_lossy(line).to_string();
                    return Ok(Some(Frame::Line(line)));
                }
                (false, None) if buf.len() > MAX_COMMAND_LINE_LENGTH => {
                    self.is_discarding = true;
                    return Err(ParseError::CommandLineTooLong);
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }
}

fn without_carriage_return(s: &[u8]) -> &[u8] {
    if let Some(&b'\r') = s.last() {
        &s[..s.len() - 1]
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn lines(codec: &mut SessionCodec, input: &str) -> Vec<String> {
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            match frame {
                Frame::Line(line) => out.push(line),
                Frame::Feed(_) => panic!("unexpected feed frame"),
            }
        }
        out
    }

    #[test]
    fn decode_lines() {
        let mut codec = SessionCodec::new();
        assert_eq!(
            lines(&mut codec, "HELLO\r\nSTATION STA XX\r\n"),
            vec!["HELLO", "STATION STA XX"]
        );
    }

    #[test]
    fn bare_terminators() {
        let mut codec = SessionCodec::new();
        assert_eq!(lines(&mut codec, "HELLO\rBYE\n"), vec!["HELLO", "BYE"]);
    }

    #[test]
    fn empty_lines_ignored() {
        let mut codec = SessionCodec::new();
        assert_eq!(lines(&mut codec, "\r\n\r\nHELLO\r\n"), vec!["HELLO"]);
    }

    #[test]
    fn partial_line_waits() {
        let mut codec = SessionCodec::new();
        let mut buf = BytesMut::from("HEL");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"LO\r\n");
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Line(line)) if line == "HELLO"
        ));
    }

    #[test]
    fn oversized_line_errors() {
        let mut codec = SessionCodec::new();
        let mut buf = BytesMut::from(&"x".repeat(400)[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ParseError::CommandLineTooLong)
        ));
    }

    #[test]
    fn feed_mode_passes_bytes_through() {
        let mut codec = SessionCodec::new();
        codec.set_feed();

        let mut buf = BytesMut::from(&b"SL000000"[..]);
        let Some(Frame::Feed(bytes)) = codec.decode(&mut buf).unwrap() else {
            panic!("expected feed frame");
        };
        assert_eq!(&bytes[..], b"SL000000");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
