/// Line codec: frames a TCP byte stream into protocol messages.
///
/// Splits on `\n` (a preceding `\r` is dropped), parses each line into a
/// [`ProtocolMessage`], and writes outgoing lines with `\r\n` termination.
/// Blank keepalive lines are skipped rather than reported.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{DecodeError, ProtocolMessage};

/// Maximum line length: 512 bytes of message plus 8191 bytes of tags.
pub const MAX_LINE_LENGTH: usize = 8191 + 512;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default)]
pub struct LineCodec;

impl Decoder for LineCodec {
    type Item = ProtocolMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(DecodeError::LineTooLong(MAX_LINE_LENGTH).into());
                }
                return Ok(None);
            };

            let mut line = src.split_to(pos);
            src.advance(1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                continue;
            }
            if line.len() > MAX_LINE_LENGTH {
                return Err(DecodeError::LineTooLong(MAX_LINE_LENGTH).into());
            }

            let text = std::str::from_utf8(&line).map_err(|_| DecodeError::InvalidUtf8)?;
            return Ok(Some(ProtocolMessage::parse(text)?));
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = item.trim_end_matches(['\r', '\n']);
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_complete_line() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from("PING :tmi.twitch.tv\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "PING");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_partial_line_then_complete() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from(":tmi.twitch.tv 3");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"76 bot :>\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "376");
    }

    #[test]
    fn decode_bare_newline_and_skips_blank_lines() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from("\r\n\nPING\nPONG\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().command, "PING");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().command, "PONG");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn malformed_line_is_an_error() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from(":prefixonly\r\n");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Decode(DecodeError::MissingCommand))
        ));
    }

    #[test]
    fn oversized_buffer_without_newline_is_rejected() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from(vec![b'a'; MAX_LINE_LENGTH + 1].as_slice());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Decode(DecodeError::LineTooLong(_)))
        ));
    }

    #[test]
    fn encode_appends_crlf() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::new();
        codec.encode("JOIN #chan".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"JOIN #chan\r\n");
    }
}
