//! Symmetric transport encryption (BIP151-flavored).
//!
//! A plaintext `encinit`/`encack` exchange carries ephemeral secp256k1
//! keys; both sides derive a session id and one cipher stream per
//! direction. After that, every message travels as two AEAD boxes — a
//! sealed length prefix and a sealed body — with the stream's send
//! counter as the nonce. Streams rekey in-band with `encack(zero33)`
//! after a byte or sequence threshold.

use crate::crypto::{CryptoError, Identity, PUBKEY_SIZE, sha256};
use crate::net::message::Packet;
use crate::net::types::MAX_MESSAGE_SIZE;
use crate::types::Hash;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use thiserror::Error;

/// Cipher suite id carried in `encinit`.
pub const CIPHER_CHACHAPOLY: u8 = 0;

/// Rekey after this many bytes on a stream.
pub const REKEY_BYTES: u64 = 1 << 30;

/// Rekey after this many messages on a stream.
pub const MAX_SEQ: u64 = u32::MAX as u64;

const TAG_SIZE: usize = 16;
const LEN_BOX_SIZE: usize = 4 + TAG_SIZE;

/// All-zero key in an `encack` marks a rekey rather than a handshake.
const ZERO_PUBKEY: [u8; PUBKEY_SIZE] = [0u8; PUBKEY_SIZE];

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("unexpected {0} in state {1}")]
    UnexpectedPacket(&'static str, &'static str),
    #[error("unknown cipher id {0}")]
    UnknownCipher(u8),
    #[error("key derivation failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("AEAD failure")]
    Aead,
    #[error("oversized encrypted frame: {0}")]
    OversizedFrame(usize),
    #[error("peer exceeded rekey threshold without rekeying")]
    RekeyOverdue,
    #[error("malformed inner packet")]
    MalformedInner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionState {
    Idle,
    SentInit,
    Handshaked,
}

/// One direction of the encrypted transport.
struct CipherStream {
    sid: Hash,
    k1: Hash,
    k2: Hash,
    seq: u64,
    processed: u64,
}

impl CipherStream {
    /// `k1 = H(sid ‖ tag ‖ 0^32)`, `k2 = H(sid ‖ tag ‖ k1)`.
    fn derive(sid: Hash, tag: u8) -> Self {
        let mut buf = Vec::with_capacity(65);
        buf.extend_from_slice(&sid);
        buf.push(tag);
        buf.extend_from_slice(&[0u8; 32]);
        let k1 = sha256(&buf);
        buf.truncate(33);
        buf.extend_from_slice(&k1);
        let k2 = sha256(&buf);
        Self { sid, k1, k2, seq: 0, processed: 0 }
    }

    fn nonce(&self) -> Nonce {
        let mut n = [0u8; 12];
        n[4..].copy_from_slice(&self.seq.to_le_bytes());
        Nonce::from(n)
    }

    fn should_rekey(&self) -> bool {
        self.processed >= REKEY_BYTES || self.seq >= MAX_SEQ
    }

    /// `k' = H(sid ‖ k)` on both keys; counters restart.
    fn rekey(&mut self) {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&self.sid);
        buf.extend_from_slice(&self.k1);
        self.k1 = sha256(&buf);
        buf.truncate(32);
        buf.extend_from_slice(&self.k2);
        self.k2 = sha256(&buf);
        self.seq = 0;
        self.processed = 0;
    }

    /// Mix the authenticated identities into the keys (post-auth rekey):
    /// `k' = H(sid ‖ k ‖ req ‖ res)`.
    fn rekey_with_identities(&mut self, req: &[u8; PUBKEY_SIZE], res: &[u8; PUBKEY_SIZE]) {
        let mut buf = Vec::with_capacity(32 + 32 + 66);
        buf.extend_from_slice(&self.sid);
        buf.extend_from_slice(&self.k1);
        buf.extend_from_slice(req);
        buf.extend_from_slice(res);
        self.k1 = sha256(&buf);
        buf.clear();
        buf.extend_from_slice(&self.sid);
        buf.extend_from_slice(&self.k2);
        buf.extend_from_slice(req);
        buf.extend_from_slice(res);
        self.k2 = sha256(&buf);
        self.seq = 0;
        self.processed = 0;
    }

    fn seal(&mut self, command: &str, payload: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let mut inner = Vec::with_capacity(1 + command.len() + payload.len());
        inner.push(command.len() as u8);
        inner.extend_from_slice(command.as_bytes());
        inner.extend_from_slice(payload);

        let nonce = self.nonce();
        let body_cipher = ChaCha20Poly1305::new(Key::from_slice(&self.k2));
        let body_ct = body_cipher
            .encrypt(&nonce, inner.as_slice())
            .map_err(|_| EncryptionError::Aead)?;

        let len_cipher = ChaCha20Poly1305::new(Key::from_slice(&self.k1));
        let len_bytes = (body_ct.len() as u32).to_le_bytes();
        let len_ct = len_cipher
            .encrypt(&nonce, len_bytes.as_slice())
            .map_err(|_| EncryptionError::Aead)?;

        self.seq += 1;
        self.processed += (len_ct.len() + body_ct.len()) as u64;

        let mut out = Vec::with_capacity(len_ct.len() + body_ct.len());
        out.extend_from_slice(&len_ct);
        out.extend_from_slice(&body_ct);
        Ok(out)
    }

    fn open_length(&self, len_ct: &[u8]) -> Result<usize, EncryptionError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.k1));
        let plain = cipher
            .decrypt(&self.nonce(), len_ct)
            .map_err(|_| EncryptionError::Aead)?;
        if plain.len() != 4 {
            return Err(EncryptionError::MalformedInner);
        }
        Ok(u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]) as usize)
    }

    fn open_body(&mut self, body_ct: &[u8]) -> Result<(String, Vec<u8>), EncryptionError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.k2));
        let inner = cipher
            .decrypt(&self.nonce(), body_ct)
            .map_err(|_| EncryptionError::Aead)?;
        self.seq += 1;
        self.processed += (LEN_BOX_SIZE + body_ct.len()) as u64;

        let cmd_len = *inner.first().ok_or(EncryptionError::MalformedInner)? as usize;
        if cmd_len == 0 || cmd_len > 12 || inner.len() < 1 + cmd_len {
            return Err(EncryptionError::MalformedInner);
        }
        let command = std::str::from_utf8(&inner[1..1 + cmd_len])
            .map_err(|_| EncryptionError::MalformedInner)?
            .to_string();
        Ok((command, inner[1 + cmd_len..].to_vec()))
    }
}

enum ReadState {
    Length,
    Body(usize),
}

/// The per-connection encryption engine.
pub struct Encryption {
    ephemeral: Identity,
    initiator: bool,
    state: EncryptionState,
    input: Option<CipherStream>,
    output: Option<CipherStream>,
    buf: Vec<u8>,
    read_state: ReadState,
    /// Set when our most recent decrypt crossed the peer's threshold.
    input_rekey_due: bool,
}

impl Encryption {
    pub fn new(initiator: bool) -> Self {
        Self {
            ephemeral: Identity::generate(),
            initiator,
            state: EncryptionState::Idle,
            input: None,
            output: None,
            buf: Vec::new(),
            read_state: ReadState::Length,
            input_rekey_due: false,
        }
    }

    pub fn state(&self) -> EncryptionState {
        self.state
    }

    pub fn is_handshaked(&self) -> bool {
        self.state == EncryptionState::Handshaked
    }

    pub fn session_id(&self) -> Option<Hash> {
        self.input.as_ref().map(|s| s.sid)
    }

    /// First handshake message (initiator side).
    pub fn init_packet(&mut self) -> Packet {
        self.state = EncryptionState::SentInit;
        Packet::EncInit { pubkey: self.ephemeral.public_key(), cipher: CIPHER_CHACHAPOLY }
    }

    fn derive_streams(&mut self, peer_pubkey: &[u8; PUBKEY_SIZE]) -> Result<(), EncryptionError> {
        let secret = self.ephemeral.ecdh(peer_pubkey)?;
        let sid = sha256(&secret);
        let (out_tag, in_tag) = if self.initiator { (b'i', b'r') } else { (b'r', b'i') };
        self.output = Some(CipherStream::derive(sid, out_tag));
        self.input = Some(CipherStream::derive(sid, in_tag));
        self.state = EncryptionState::Handshaked;
        Ok(())
    }

    /// Drive the handshake with an incoming plaintext `encinit`/`encack`.
    /// Returns a reply to send, if any.
    pub fn on_packet(&mut self, packet: &Packet) -> Result<Option<Packet>, EncryptionError> {
        match (packet, self.state) {
            (Packet::EncInit { pubkey, cipher }, EncryptionState::Idle) => {
                if *cipher != CIPHER_CHACHAPOLY {
                    return Err(EncryptionError::UnknownCipher(*cipher));
                }
                self.derive_streams(pubkey)?;
                Ok(Some(Packet::EncAck { pubkey: self.ephemeral.public_key() }))
            }
            (Packet::EncInit { .. }, _) => {
                Err(EncryptionError::UnexpectedPacket("encinit", self.state_name()))
            }
            (Packet::EncAck { pubkey }, EncryptionState::SentInit) => {
                if *pubkey == ZERO_PUBKEY {
                    return Err(EncryptionError::UnexpectedPacket("rekey", "SentInit"));
                }
                self.derive_streams(pubkey)?;
                Ok(None)
            }
            (Packet::EncAck { .. }, _) => {
                Err(EncryptionError::UnexpectedPacket("encack", self.state_name()))
            }
            _ => Err(EncryptionError::UnexpectedPacket("packet", self.state_name())),
        }
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            EncryptionState::Idle => "Idle",
            EncryptionState::SentInit => "SentInit",
            EncryptionState::Handshaked => "Handshaked",
        }
    }

    /// Seal an outgoing message. If the stream crossed its rekey
    /// threshold, the returned bytes also carry the rekey notice and the
    /// stream re-derives before the next message.
    pub fn seal(&mut self, command: &str, payload: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let stream = self
            .output
            .as_mut()
            .ok_or(EncryptionError::UnexpectedPacket("seal", "Idle"))?;
        let mut out = stream.seal(command, payload)?;
        if stream.should_rekey() {
            let notice = Packet::EncAck { pubkey: ZERO_PUBKEY };
            out.extend_from_slice(&stream.seal("encack", &notice.encode_payload())?);
            stream.rekey();
        }
        Ok(out)
    }

    /// Buffer incoming ciphertext. Decryption happens one message at a
    /// time through [`next_packet`], so key changes applied between
    /// messages (post-auth rekey) take effect at the right boundary.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), EncryptionError> {
        if self.input.is_none() {
            return Err(EncryptionError::UnexpectedPacket("feed", "Idle"));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Decrypt at most one complete message from the buffer. Rekey
    /// notices are absorbed here and never surface.
    pub fn next_packet(&mut self) -> Result<Option<(String, Vec<u8>)>, EncryptionError> {
        loop {
            match self.read_state {
                ReadState::Length => {
                    if self.buf.len() < LEN_BOX_SIZE {
                        return Ok(None);
                    }
                    let stream = self
                        .input
                        .as_ref()
                        .ok_or(EncryptionError::UnexpectedPacket("feed", "Idle"))?;
                    let len_ct: Vec<u8> = self.buf.drain(..LEN_BOX_SIZE).collect();
                    let body_len = stream.open_length(&len_ct)?;
                    if body_len > MAX_MESSAGE_SIZE + 64 {
                        return Err(EncryptionError::OversizedFrame(body_len));
                    }
                    self.read_state = ReadState::Body(body_len);
                }
                ReadState::Body(body_len) => {
                    if self.buf.len() < body_len {
                        return Ok(None);
                    }
                    let stream = self
                        .input
                        .as_mut()
                        .ok_or(EncryptionError::UnexpectedPacket("feed", "Idle"))?;
                    let body_ct: Vec<u8> = self.buf.drain(..body_len).collect();
                    let (command, payload) = stream.open_body(&body_ct)?;
                    self.read_state = ReadState::Length;

                    if command == "encack" && payload.as_slice() == ZERO_PUBKEY.as_slice() {
                        // Rekey notice: honored exactly once, only at a
                        // message boundary (which is where we are).
                        stream.rekey();
                        self.input_rekey_due = false;
                        continue;
                    }
                    if self.input_rekey_due {
                        return Err(EncryptionError::RekeyOverdue);
                    }
                    if stream.should_rekey() {
                        self.input_rekey_due = true;
                    }
                    return Ok(Some((command, payload)));
                }
            }
        }
    }

    /// Drain every decryptable message (tests and simple callers).
    #[cfg(test)]
    fn drain_packets(
        &mut self,
        out: &mut Vec<(String, Vec<u8>)>,
    ) -> Result<(), EncryptionError> {
        while let Some(packet) = self.next_packet()? {
            out.push(packet);
        }
        Ok(())
    }

    /// Post-auth rekey of both directions with the authenticated
    /// identities mixed in.
    pub fn rekey_with_identities(
        &mut self,
        requester: &[u8; PUBKEY_SIZE],
        responder: &[u8; PUBKEY_SIZE],
    ) {
        if let Some(stream) = self.output.as_mut() {
            stream.rekey_with_identities(requester, responder);
        }
        if let Some(stream) = self.input.as_mut() {
            stream.rekey_with_identities(requester, responder);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshaken_pair() -> (Encryption, Encryption) {
        let mut alice = Encryption::new(true);
        let mut bob = Encryption::new(false);
        let init = alice.init_packet();
        let ack = bob.on_packet(&init).unwrap().unwrap();
        assert!(bob.is_handshaked());
        assert!(alice.on_packet(&ack).unwrap().is_none());
        assert!(alice.is_handshaked());
        (alice, bob)
    }

    #[test]
    fn handshake_and_round_trip() {
        let (mut alice, mut bob) = handshaken_pair();
        assert_eq!(alice.session_id(), bob.session_id());

        let ct = alice.seal("ping", &42u64.to_le_bytes()).unwrap();
        let mut got = Vec::new();
        bob.feed(&ct).unwrap();
        bob.drain_packets(&mut got).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, "ping");
        assert_eq!(got[0].1, 42u64.to_le_bytes());

        // And the reverse direction with its own keys.
        let ct = bob.seal("pong", &42u64.to_le_bytes()).unwrap();
        let mut got = Vec::new();
        alice.feed(&ct).unwrap();
        alice.drain_packets(&mut got).unwrap();
        assert_eq!(got[0].0, "pong");
    }

    #[test]
    fn feed_handles_partial_chunks() {
        let (mut alice, mut bob) = handshaken_pair();
        let ct = alice.seal("inv", b"payload-bytes").unwrap();
        let mut got = Vec::new();
        for chunk in ct.chunks(3) {
            bob.feed(chunk).unwrap();
            bob.drain_packets(&mut got).unwrap();
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, b"payload-bytes");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (mut alice, mut bob) = handshaken_pair();
        let mut ct = alice.seal("ping", &[]).unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 1;
        bob.feed(&ct).unwrap();
        let mut got = Vec::new();
        assert!(bob.drain_packets(&mut got).is_err());
    }

    #[test]
    fn no_data_packets_before_handshake() {
        let mut engine = Encryption::new(true);
        assert!(engine.seal("ping", &[]).is_err());
        assert!(engine.feed(&[0u8; 64]).is_err());
        // Non-handshake packet rejected by the state machine.
        assert!(engine.on_packet(&Packet::Verack).is_err());
    }

    #[test]
    fn duplicate_encinit_rejected() {
        let mut bob = Encryption::new(false);
        let mut alice = Encryption::new(true);
        let init = alice.init_packet();
        bob.on_packet(&init).unwrap();
        assert!(bob.on_packet(&init).is_err());
    }

    #[test]
    fn rekey_at_sequence_threshold() {
        let (mut alice, mut bob) = handshaken_pair();

        // Force the sender over the sequence threshold.
        alice.output.as_mut().unwrap().seq = MAX_SEQ - 1;
        bob.input.as_mut().unwrap().seq = MAX_SEQ - 1;

        // This seal crosses the threshold: ciphertext carries the
        // message plus the rekey notice, and the sender re-derives.
        let ct = alice.seal("ping", &[]).unwrap();
        bob.feed(&ct).unwrap();
        let mut got = Vec::new();
        bob.drain_packets(&mut got).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(bob.input.as_ref().unwrap().seq, 0);

        // Traffic continues under the new keys.
        let ct = alice.seal("ping", &7u64.to_le_bytes()).unwrap();
        bob.feed(&ct).unwrap();
        let mut got = Vec::new();
        bob.drain_packets(&mut got).unwrap();
        assert_eq!(got[0].0, "ping");
    }

    #[test]
    fn identity_rekey_keeps_streams_in_sync() {
        let (mut alice, mut bob) = handshaken_pair();
        let req = [2u8; PUBKEY_SIZE];
        let res = [3u8; PUBKEY_SIZE];
        alice.rekey_with_identities(&req, &res);
        bob.rekey_with_identities(&req, &res);

        let ct = alice.seal("verack", &[]).unwrap();
        bob.feed(&ct).unwrap();
        let mut got = Vec::new();
        bob.drain_packets(&mut got).unwrap();
        assert_eq!(got[0].0, "verack");
    }
}
