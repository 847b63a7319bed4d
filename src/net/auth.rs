//! Peer identity authentication (BIP150-flavored), layered on top of the
//! encrypted transport.
//!
//! Both sides prove possession of long-lived secp256k1 identity keys by
//! signing hashes bound to the encryption session id. Challenges commit
//! to the *counterparty's* key, so nothing useful can be signed for a
//! session the key holder is not part of. A mismatched challenge is
//! answered with a zero signature — we never sign data we did not
//! derive ourselves.

use crate::crypto::{CryptoError, Identity, PUBKEY_SIZE, SIG_SIZE, sha256, verify};
use crate::net::message::Packet;
use crate::types::{Hash, ZERO_HASH};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const ZERO_SIG: [u8; SIG_SIZE] = [0u8; SIG_SIZE];

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("no known identity key for {0}")]
    UnknownPeer(String),
    #[error("peer identity not in authorized set")]
    Unauthorized,
    #[error("duplicate {0}")]
    Duplicate(&'static str),
    #[error("unexpected {0}")]
    Unexpected(&'static str),
    #[error("peer refused authentication (zero signature)")]
    Refused,
    #[error("bad signature")]
    BadSignature,
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("identity file: {0}")]
    File(String),
}

/// `H(sid ‖ tag ‖ pubkey)` — the session-bound commitment all
/// challenges, replies, and proposals are built from.
fn auth_hash(sid: &Hash, tag: u8, pubkey: &[u8; PUBKEY_SIZE]) -> Hash {
    let mut buf = Vec::with_capacity(32 + 1 + PUBKEY_SIZE);
    buf.extend_from_slice(sid);
    buf.push(tag);
    buf.extend_from_slice(pubkey);
    sha256(&buf)
}

// =============================================================================
// KEY DATABASE
// =============================================================================

/// Authorized identity keys plus hostname → known-key bindings, loaded
/// from the two flat key files.
#[derive(Default)]
pub struct AuthDb {
    authorized: Vec<[u8; PUBKEY_SIZE]>,
    known: HashMap<String, [u8; PUBKEY_SIZE]>,
}

impl AuthDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `known-peers` and/or `authorized-peers` files.
    pub fn open(
        known_path: Option<&Path>,
        authorized_path: Option<&Path>,
    ) -> Result<Self, AuthError> {
        let mut db = Self::new();
        if let Some(path) = known_path {
            let text = std::fs::read_to_string(path)
                .map_err(|e| AuthError::File(format!("{}: {e}", path.display())))?;
            db.parse_known(&text)?;
        }
        if let Some(path) = authorized_path {
            let text = std::fs::read_to_string(path)
                .map_err(|e| AuthError::File(format!("{}: {e}", path.display())))?;
            db.parse_authorized(&text)?;
        }
        Ok(db)
    }

    /// `hostname[,ip] HEX33` per line; `#` starts a comment.
    pub fn parse_known(&mut self, text: &str) -> Result<(), AuthError> {
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let names = parts
                .next()
                .ok_or_else(|| AuthError::File("missing hostname".into()))?;
            let hex = parts
                .next()
                .ok_or_else(|| AuthError::File(format!("missing key for {names}")))?;
            let key = parse_key(hex)?;
            for name in names.split(',') {
                if !name.is_empty() {
                    self.known.insert(name.to_string(), key);
                }
            }
        }
        Ok(())
    }

    /// `HEX33` per line; `#` starts a comment.
    pub fn parse_authorized(&mut self, text: &str) -> Result<(), AuthError> {
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            self.add_authorized(parse_key(line)?);
        }
        Ok(())
    }

    pub fn add_known(&mut self, host: &str, key: [u8; PUBKEY_SIZE]) {
        self.known.insert(host.to_string(), key);
    }

    pub fn add_authorized(&mut self, key: [u8; PUBKEY_SIZE]) {
        if !self.authorized.contains(&key) {
            self.authorized.push(key);
        }
    }

    /// Look up a known key by hostname, falling back to the bare host
    /// when the stored entry has no port.
    pub fn get_known(&self, host: &str) -> Option<[u8; PUBKEY_SIZE]> {
        if let Some(key) = self.known.get(host) {
            return Some(*key);
        }
        let bare = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
        self.known.get(bare).copied()
    }

    pub fn authorized(&self) -> &[[u8; PUBKEY_SIZE]] {
        &self.authorized
    }

    /// Constant-time scan for the key whose proposal hash matches.
    fn find_proposed(&self, sid: &Hash, proposal: &Hash) -> Option<[u8; PUBKEY_SIZE]> {
        let mut found = None;
        for key in &self.authorized {
            let hash = auth_hash(sid, b'p', key);
            if bool::from(hash.as_slice().ct_eq(proposal.as_slice())) {
                found = Some(*key);
            }
        }
        found
    }
}

fn parse_key(hex_str: &str) -> Result<[u8; PUBKEY_SIZE], AuthError> {
    let bytes = hex::decode(hex_str)
        .map_err(|_| AuthError::File(format!("bad hex key: {hex_str}")))?;
    if bytes.len() != PUBKEY_SIZE || (bytes[0] != 0x02 && bytes[0] != 0x03) {
        return Err(AuthError::File(format!("not a compressed key: {hex_str}")));
    }
    let mut key = [0u8; PUBKEY_SIZE];
    key.copy_from_slice(&bytes);
    Ok(key)
}

// =============================================================================
// ENGINE
// =============================================================================

/// Per-connection auth state machine. Runs only once the encryption
/// engine is handshaked (it needs the session id).
pub struct AuthEngine {
    outbound: bool,
    identity: Arc<Identity>,
    db: Arc<AuthDb>,
    sid: Hash,
    peer_identity: Option<[u8; PUBKEY_SIZE]>,
    challenge_sent: bool,
    challenge_received: bool,
    reply_received: bool,
    propose_received: bool,
    auth: bool,
    completed: bool,
}

impl AuthEngine {
    pub fn new(outbound: bool, identity: Arc<Identity>, db: Arc<AuthDb>, sid: Hash) -> Self {
        Self {
            outbound,
            identity,
            db,
            sid,
            peer_identity: None,
            challenge_sent: false,
            challenge_received: false,
            reply_received: false,
            propose_received: false,
            auth: false,
            completed: false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn is_auth(&self) -> bool {
        self.auth
    }

    pub fn peer_identity(&self) -> Option<[u8; PUBKEY_SIZE]> {
        self.peer_identity
    }

    /// Requester/responder identity pair for the post-auth rekey.
    pub fn identities(&self) -> Option<([u8; PUBKEY_SIZE], [u8; PUBKEY_SIZE])> {
        let ours = self.identity.public_key();
        let theirs = self.peer_identity?;
        Some(if self.outbound { (ours, theirs) } else { (theirs, ours) })
    }

    /// Kick off the exchange. Outbound peers must already know the
    /// remote identity; inbound peers wait for a proposal.
    pub fn start(&mut self, hostname: &str) -> Result<Option<Packet>, AuthError> {
        if !self.outbound {
            return Ok(None);
        }
        let peer_key = self
            .db
            .get_known(hostname)
            .ok_or_else(|| AuthError::UnknownPeer(hostname.to_string()))?;
        self.peer_identity = Some(peer_key);
        self.challenge_sent = true;
        Ok(Some(Packet::AuthChallenge(auth_hash(&self.sid, b'i', &peer_key))))
    }

    /// Feed an auth packet; returns packets to send back.
    pub fn on_packet(&mut self, packet: &Packet) -> Result<Vec<Packet>, AuthError> {
        match packet {
            Packet::AuthChallenge(hash) => self.on_challenge(hash),
            Packet::AuthReply(sig) => self.on_reply(sig),
            Packet::AuthPropose(hash) => self.on_propose(hash),
            _ => Err(AuthError::Unexpected("packet")),
        }
    }

    fn on_challenge(&mut self, hash: &Hash) -> Result<Vec<Packet>, AuthError> {
        if self.challenge_received {
            return Err(AuthError::Duplicate("authchallenge"));
        }
        self.challenge_received = true;

        // The challenger tags with its own role.
        let tag = if self.outbound { b'r' } else { b'i' };
        let msg = auth_hash(&self.sid, tag, &self.identity.public_key());

        if *hash == ZERO_HASH || *hash != msg {
            // Never sign a hash we did not derive.
            return Ok(vec![Packet::AuthReply(ZERO_SIG)]);
        }

        let sig = self.identity.sign(&msg)?;
        if self.outbound {
            // Second leg done; the responder's verify finishes the dance.
            self.auth = true;
            self.completed = true;
        }
        Ok(vec![Packet::AuthReply(sig)])
    }

    fn on_reply(&mut self, sig: &[u8; SIG_SIZE]) -> Result<Vec<Packet>, AuthError> {
        if self.reply_received && !self.outbound {
            return Err(AuthError::Duplicate("authreply"));
        }
        if !self.challenge_sent {
            return Err(AuthError::Unexpected("authreply"));
        }
        if *sig == ZERO_SIG {
            return Err(AuthError::Refused);
        }

        let peer = self.peer_identity.ok_or(AuthError::Unexpected("authreply"))?;
        let tag = if self.outbound { b'i' } else { b'r' };
        let msg = auth_hash(&self.sid, tag, &peer);
        verify(&peer, &msg, sig).map_err(|_| AuthError::BadSignature)?;

        if self.outbound {
            if self.reply_received {
                return Err(AuthError::Duplicate("authreply"));
            }
            self.reply_received = true;
            // Identify ourselves so the responder can challenge back.
            let propose = auth_hash(&self.sid, b'p', &self.identity.public_key());
            Ok(vec![Packet::AuthPropose(propose)])
        } else {
            self.reply_received = true;
            self.auth = true;
            self.completed = true;
            Ok(vec![])
        }
    }

    fn on_propose(&mut self, proposal: &Hash) -> Result<Vec<Packet>, AuthError> {
        if self.outbound {
            return Err(AuthError::Unexpected("authpropose"));
        }
        if self.propose_received {
            return Err(AuthError::Duplicate("authpropose"));
        }
        self.propose_received = true;

        let key = self
            .db
            .find_proposed(&self.sid, proposal)
            .ok_or(AuthError::Unauthorized)?;
        self.peer_identity = Some(key);
        self.challenge_sent = true;
        Ok(vec![Packet::AuthChallenge(auth_hash(&self.sid, b'r', &key))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::identity_address;

    fn engines() -> (AuthEngine, AuthEngine, Arc<Identity>, Arc<Identity>) {
        let alice_id = Arc::new(Identity::generate());
        let bob_id = Arc::new(Identity::generate());
        let sid = sha256(b"session");

        // Alice (outbound) knows Bob's key by hostname; Bob authorizes Alice.
        let mut alice_db = AuthDb::new();
        alice_db.add_known("bob.example:8333", bob_id.public_key());
        let mut bob_db = AuthDb::new();
        bob_db.add_authorized(alice_id.public_key());

        let alice =
            AuthEngine::new(true, alice_id.clone(), Arc::new(alice_db), sid);
        let bob = AuthEngine::new(false, bob_id.clone(), Arc::new(bob_db), sid);
        (alice, bob, alice_id, bob_id)
    }

    /// Run the full five-message exchange.
    fn run_exchange(alice: &mut AuthEngine, bob: &mut AuthEngine) -> Result<(), AuthError> {
        let mut to_bob: Vec<Packet> =
            alice.start("bob.example:8333")?.into_iter().collect();
        let mut to_alice: Vec<Packet> = Vec::new();
        // Bounded relay loop; the exchange is five messages deep.
        for _ in 0..8 {
            for packet in std::mem::take(&mut to_bob) {
                to_alice.extend(bob.on_packet(&packet)?);
            }
            for packet in std::mem::take(&mut to_alice) {
                to_bob.extend(alice.on_packet(&packet)?);
            }
            if alice.is_completed() && bob.is_completed() {
                return Ok(());
            }
        }
        Err(AuthError::Unexpected("exchange did not complete"))
    }

    #[test]
    fn full_exchange_completes() {
        let (mut alice, mut bob, alice_id, bob_id) = engines();
        run_exchange(&mut alice, &mut bob).unwrap();
        assert!(alice.is_auth() && bob.is_auth());
        assert_eq!(bob.peer_identity(), Some(alice_id.public_key()));
        assert_eq!(alice.peer_identity(), Some(bob_id.public_key()));
        // Both sides agree on the requester/responder pair.
        assert_eq!(alice.identities(), bob.identities());
    }

    #[test]
    fn outbound_without_known_key_fails() {
        let id = Arc::new(Identity::generate());
        let mut engine =
            AuthEngine::new(true, id, Arc::new(AuthDb::new()), sha256(b"sid"));
        assert!(matches!(
            engine.start("stranger.example:8333"),
            Err(AuthError::UnknownPeer(_))
        ));
    }

    #[test]
    fn mismatched_challenge_gets_zero_signature() {
        let (_, mut bob, _, _) = engines();
        // A challenge not derived from Bob's key.
        let bogus = sha256(b"not a real challenge");
        let replies = bob.on_packet(&Packet::AuthChallenge(bogus)).unwrap();
        assert!(
            matches!(replies.as_slice(), [Packet::AuthReply(sig)] if *sig == ZERO_SIG)
        );
        assert!(!bob.is_auth());
    }

    #[test]
    fn duplicate_challenge_rejected() {
        let (_, mut bob, _alice_id, bob_id) = engines();
        let sid = sha256(b"session");
        let challenge = auth_hash(&sid, b'i', &bob_id.public_key());
        bob.on_packet(&Packet::AuthChallenge(challenge)).unwrap();
        assert!(matches!(
            bob.on_packet(&Packet::AuthChallenge(challenge)),
            Err(AuthError::Duplicate(_))
        ));
    }

    #[test]
    fn unauthorized_proposal_rejected() {
        let (_, mut bob, _, _) = engines();
        let stranger = Identity::generate();
        let proposal = auth_hash(&sha256(b"session"), b'p', &stranger.public_key());
        assert!(matches!(
            bob.on_packet(&Packet::AuthPropose(proposal)),
            Err(AuthError::Unauthorized)
        ));
    }

    #[test]
    fn key_file_parsing() {
        let key_hex = hex::encode(Identity::generate().public_key());
        let known = format!(
            "# comment line\nseed.example,1.2.3.4 {key_hex}\n\nplain.example {key_hex} # trailing\n"
        );
        let mut db = AuthDb::new();
        db.parse_known(&known).unwrap();
        assert!(db.get_known("seed.example").is_some());
        assert!(db.get_known("1.2.3.4").is_some());
        assert!(db.get_known("plain.example:8333").is_some()); // port stripped
        assert!(db.get_known("other.example").is_none());

        let mut db = AuthDb::new();
        db.parse_authorized(&format!("{key_hex}\n# done\n")).unwrap();
        assert_eq!(db.authorized().len(), 1);

        let mut db = AuthDb::new();
        assert!(db.parse_authorized("deadbeef\n").is_err());
    }

    #[test]
    fn identity_address_shape() {
        let id = Identity::generate();
        let addr = identity_address(&id.public_key());
        assert!(!addr.is_empty());
        assert!(crate::crypto::decode_identity_address(&addr).is_some());
    }
}
