//! Plaintext message framing.
//!
//! Envelope: `magic(4) ‖ command(12, NUL-padded) ‖ length(4 LE) ‖
//! checksum(4) ‖ payload`. The checksum is the first four bytes of the
//! double-SHA256 of the payload. The parser is an incremental state
//! machine fed arbitrary byte chunks; any malformed input is fatal for
//! the connection.

use crate::crypto::checksum;
use crate::net::types::MAX_MESSAGE_SIZE;
use thiserror::Error;

pub const HEADER_SIZE: usize = 24;
const COMMAND_SIZE: usize = 12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("bad magic: {0:08x}")]
    BadMagic(u32),
    #[error("bad command encoding")]
    BadCommand,
    #[error("oversized payload: {0}")]
    OversizedPayload(u32),
    #[error("checksum mismatch for {0}")]
    BadChecksum(String),
}

/// A parsed-but-undecoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub command: String,
    pub payload: Vec<u8>,
}

/// Builds outgoing envelopes.
#[derive(Clone, Copy)]
pub struct Framer {
    magic: [u8; 4],
}

impl Framer {
    pub fn new(magic: [u8; 4]) -> Self {
        Self { magic }
    }

    /// Frame a payload. `cached_checksum` lets callers that already
    /// hashed the body (tx relay) skip the double-SHA256.
    pub fn packet(&self, command: &str, body: &[u8], cached_checksum: Option<[u8; 4]>) -> Vec<u8> {
        debug_assert!(command.len() <= COMMAND_SIZE);
        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.extend_from_slice(&self.magic);
        let mut cmd = [0u8; COMMAND_SIZE];
        cmd[..command.len().min(COMMAND_SIZE)]
            .copy_from_slice(&command.as_bytes()[..command.len().min(COMMAND_SIZE)]);
        out.extend_from_slice(&cmd);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&cached_checksum.unwrap_or_else(|| checksum(body)));
        out.extend_from_slice(body);
        out
    }
}

enum ParseState {
    Header,
    Payload { command: String, length: usize, check: [u8; 4] },
}

/// Incremental envelope parser.
pub struct Parser {
    magic: [u8; 4],
    buf: Vec<u8>,
    state: ParseState,
}

impl Parser {
    pub fn new(magic: [u8; 4]) -> Self {
        Self { magic, buf: Vec::new(), state: ParseState::Header }
    }

    /// Hand back buffered-but-unparsed bytes (transport upgrades switch
    /// the remaining stream to another decoder).
    pub fn take_buffer(&mut self) -> Vec<u8> {
        self.state = ParseState::Header;
        std::mem::take(&mut self.buf)
    }

    /// Consume a chunk; returns every complete packet it finished.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<RawPacket>, FramingError> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        loop {
            match &self.state {
                ParseState::Header => {
                    if self.buf.len() < HEADER_SIZE {
                        return Ok(out);
                    }
                    let header: Vec<u8> = self.buf.drain(..HEADER_SIZE).collect();
                    if header[..4] != self.magic {
                        let got = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
                        return Err(FramingError::BadMagic(got));
                    }
                    let command = parse_command(&header[4..16])?;
                    let length =
                        u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
                    if length as usize > MAX_MESSAGE_SIZE {
                        return Err(FramingError::OversizedPayload(length));
                    }
                    let mut check = [0u8; 4];
                    check.copy_from_slice(&header[20..24]);
                    self.state =
                        ParseState::Payload { command, length: length as usize, check };
                }
                ParseState::Payload { command, length, check } => {
                    if self.buf.len() < *length {
                        return Ok(out);
                    }
                    let payload: Vec<u8> = self.buf.drain(..*length).collect();
                    if checksum(&payload) != *check {
                        return Err(FramingError::BadChecksum(command.clone()));
                    }
                    out.push(RawPacket { command: command.clone(), payload });
                    self.state = ParseState::Header;
                }
            }
        }
    }
}

fn parse_command(bytes: &[u8]) -> Result<String, FramingError> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(COMMAND_SIZE);
    let cmd = &bytes[..end];
    // NUL padding must run to the end, and the name must be printable ASCII.
    if cmd.is_empty()
        || bytes[end..].iter().any(|&b| b != 0)
        || cmd.iter().any(|&b| !b.is_ascii_graphic())
    {
        return Err(FramingError::BadCommand);
    }
    Ok(String::from_utf8_lossy(cmd).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::types::Network;

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    #[test]
    fn frame_and_parse() {
        let framer = Framer::new(MAGIC);
        let mut parser = Parser::new(MAGIC);

        let frame = framer.packet("ping", &7u64.to_le_bytes(), None);
        let packets = parser.feed(&frame).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].command, "ping");
        assert_eq!(packets[0].payload, 7u64.to_le_bytes());
    }

    #[test]
    fn parses_across_chunk_boundaries() {
        let framer = Framer::new(MAGIC);
        let mut parser = Parser::new(MAGIC);

        let mut stream = framer.packet("verack", &[], None);
        stream.extend(framer.packet("getaddr", &[], None));

        let mut got = Vec::new();
        for chunk in stream.chunks(5) {
            got.extend(parser.feed(chunk).unwrap());
        }
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].command, "verack");
        assert_eq!(got[1].command, "getaddr");
    }

    #[test]
    fn cached_checksum_matches_computed() {
        let framer = Framer::new(MAGIC);
        let body = b"some tx bytes".to_vec();
        let cached = framer.packet("tx", &body, Some(crate::crypto::checksum(&body)));
        let computed = framer.packet("tx", &body, None);
        assert_eq!(cached, computed);
    }

    #[test]
    fn wrong_magic_is_fatal() {
        let framer = Framer::new(Network::Mainnet.magic());
        let mut parser = Parser::new(MAGIC);
        let frame = framer.packet("ping", &[], None);
        assert!(matches!(parser.feed(&frame), Err(FramingError::BadMagic(_))));
    }

    #[test]
    fn corrupt_checksum_is_fatal() {
        let framer = Framer::new(MAGIC);
        let mut parser = Parser::new(MAGIC);
        let mut frame = framer.packet("ping", &1u64.to_le_bytes(), None);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(matches!(parser.feed(&frame), Err(FramingError::BadChecksum(_))));
    }

    #[test]
    fn oversized_length_is_fatal() {
        let mut parser = Parser::new(MAGIC);
        let mut header = Vec::new();
        header.extend_from_slice(&MAGIC);
        header.extend_from_slice(b"block\0\0\0\0\0\0\0");
        header.extend_from_slice(&(u32::MAX).to_le_bytes());
        header.extend_from_slice(&[0u8; 4]);
        assert!(matches!(parser.feed(&header), Err(FramingError::OversizedPayload(_))));
    }

    #[test]
    fn bad_command_padding_is_fatal() {
        let mut parser = Parser::new(MAGIC);
        let mut header = Vec::new();
        header.extend_from_slice(&MAGIC);
        header.extend_from_slice(b"ping\0x\0\0\0\0\0\0"); // byte after NUL
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&crate::crypto::checksum(&[]));
        assert!(matches!(parser.feed(&header), Err(FramingError::BadCommand)));
    }
}
