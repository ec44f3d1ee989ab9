//! IRC line codec — frames a TCP byte stream into IRC messages.
//!
//! Splits on `\r\n` (per RFC 2812), parses each line into a [`Message`],
//! and serializes outgoing messages with `\r\n` termination. Bare `\n`
//! terminators are tolerated on decode; some bridged-to daemons send them.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, ParseError};

/// Maximum line length (including `\r\n`).
/// RFC 2812 says 512 bytes. IRCv3 `message-tags` can push this to 8191.
const MAX_LINE_LENGTH: usize = 8191;

/// Codec error: either a protocol parse failure or an I/O error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({MAX_LINE_LENGTH} bytes)")]
    LineTooLong,
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec that frames IRC messages on line boundaries.
#[derive(Debug, Default)]
pub struct IrcCodec;

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(nl_pos) = src.iter().position(|&b| b == b'\n') else {
            // No complete line yet. Check if the buffer is getting too large.
            if src.len() > MAX_LINE_LENGTH {
                return Err(CodecError::LineTooLong);
            }
            return Ok(None);
        };

        // Extract the line, drop the terminator and any preceding `\r`.
        let mut line_bytes = src.split_to(nl_pos);
        src.advance(1);
        if line_bytes.last() == Some(&b'\r') {
            line_bytes.truncate(line_bytes.len() - 1);
        }

        if line_bytes.is_empty() {
            // Blank keep-alive line; recurse for the next frame.
            return self.decode(src);
        }

        let line = std::str::from_utf8(&line_bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        Ok(Some(Message::parse(line)?))
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn decode_complete_line() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from("NICK wings\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "NICK");
        assert_eq!(msg.params, vec!["wings"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_partial_line_then_complete() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from("JOIN #estu");

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"ary\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "JOIN");
        assert_eq!(msg.params, vec!["#estuary"]);
    }

    #[test]
    fn decode_two_messages_in_one_read() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from("NICK wings\r\nUSER wings 0 * :Wings\r\n");

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().command, "NICK");
        let msg2 = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg2.command, "USER");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_bare_newline_terminator() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from("PING :irc.example.net\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "PING");
    }

    #[test]
    fn decode_skips_blank_lines() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from("\r\nPING :tok\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "PING");
    }

    #[test]
    fn decode_rejects_oversized_line() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from(vec![b'A'; MAX_LINE_LENGTH + 1].as_slice());
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::LineTooLong));
    }

    #[test]
    fn decode_empty_buffer() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encode_appends_crlf() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::nick("wings"), &mut buf).unwrap();
        assert_eq!(&buf[..], b"NICK :wings\r\n");
    }

    #[test]
    fn roundtrip_through_codec() {
        let mut codec = IrcCodec;
        let original = Message::privmsg("#estuary", "Hello everyone!");
        let mut buf = BytesMut::new();
        codec.encode(original.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
    }
}
