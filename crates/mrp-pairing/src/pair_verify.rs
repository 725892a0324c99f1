//! Session verification (pair-verify, sequence M1-M3).
//!
//! Runs on every connection once credentials exist. An ephemeral X25519
//! exchange authenticated by the long-term Ed25519 keys from pair-setup
//! yields the per-session read/write keys. Unlike pair-setup there is no
//! closing round from the device: the client derives its session keys
//! immediately after sending M3.

use mrp_core::error::{AuthError, Error, PairingError, Result};
use mrp_core::Credentials;
use mrp_crypto::{
    chacha::{decrypt_with_nonce, encrypt_with_nonce, nonce_from_string},
    curve25519::EphemeralKeys,
    ed25519::{self, IdentityKeys},
    hkdf,
    keys::{SessionKeys, SharedSecret},
    tlv::{Tlv8, TlvTag},
};
use tracing::debug;

const PV_MSG02_NONCE: &[u8] = b"PV-Msg02";
const PV_MSG03_NONCE: &[u8] = b"PV-Msg03";

/// Pair-verify state machine.
pub struct PairVerify {
    state: PairVerifyState,
    credentials: Credentials,
    identity: IdentityKeys,
    ephemeral: Option<EphemeralKeys>,
    ephemeral_public: Option<[u8; 32]>,
    shared_secret: Option<SharedSecret>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairVerifyState {
    Idle,
    AwaitM2,
    Done,
    Failed,
}

impl PairVerify {
    /// Create a verify exchange from stored credentials.
    pub fn new(credentials: Credentials) -> Self {
        let identity = IdentityKeys::from_seed(&credentials.local_private_key);
        Self {
            state: PairVerifyState::Idle,
            credentials,
            identity,
            ephemeral: None,
            ephemeral_public: None,
            shared_secret: None,
        }
    }

    pub fn state(&self) -> PairVerifyState {
        self.state
    }

    /// The sequence number the next inbound TLV must carry.
    pub fn expected_seq(&self) -> Option<u8> {
        match self.state {
            PairVerifyState::AwaitM2 => Some(2),
            _ => None,
        }
    }

    /// Generate M1: `{Seq=1, PublicKey=ephemeral}`.
    pub fn start(&mut self) -> Result<Vec<u8>> {
        if self.state != PairVerifyState::Idle {
            self.state = PairVerifyState::Failed;
            return Err(
                PairingError::InvalidState("M1 can only be generated from Idle".into()).into(),
            );
        }
        self.state = PairVerifyState::Failed;

        let ephemeral = EphemeralKeys::generate();
        let public = ephemeral.public_key();

        let mut tlv = Tlv8::new();
        tlv.set(TlvTag::SeqNo, vec![0x01]);
        tlv.set(TlvTag::PublicKey, public.to_vec());

        self.ephemeral = Some(ephemeral);
        self.ephemeral_public = Some(public);
        self.state = PairVerifyState::AwaitM2;
        Ok(tlv.encode())
    }

    /// Process M2 `{Seq=2, PublicKey, EncryptedData}` and generate M3
    /// `{Seq=3, EncryptedData}`.
    ///
    /// On success the session keys are derivable via
    /// [`PairVerify::into_session_keys`].
    pub fn process_m2(&mut self, pairing_data: &[u8]) -> Result<Vec<u8>> {
        if self.state != PairVerifyState::AwaitM2 {
            self.state = PairVerifyState::Failed;
            return Err(PairingError::InvalidState("M2 arrived out of order".into()).into());
        }
        self.state = PairVerifyState::Failed;

        let tlv = Tlv8::parse(pairing_data)
            .map_err(|e| Error::Pairing(PairingError::Protocol(format!("verify TLV: {e}"))))?;

        if let Some(code) = tlv.error() {
            return Err(AuthError::Rejected(code).into());
        }
        match tlv.seq() {
            Some(2) => {}
            other => {
                return Err(PairingError::SequenceMismatch {
                    expected: 2,
                    actual: other.unwrap_or(0),
                }
                .into())
            }
        }

        let device_public: [u8; 32] = tlv
            .get(TlvTag::PublicKey)
            .ok_or(PairingError::MissingTag(TlvTag::PublicKey as u8))?
            .try_into()
            .map_err(|_| {
                Error::Pairing(PairingError::Protocol(
                    "M2 ephemeral key is not 32 bytes".into(),
                ))
            })?;
        let sealed = tlv
            .get(TlvTag::EncryptedData)
            .ok_or(PairingError::MissingTag(TlvTag::EncryptedData as u8))?;

        let client_public = self
            .ephemeral_public
            .ok_or(PairingError::InvalidState("ephemeral key missing".into()))?;
        let ephemeral = self
            .ephemeral
            .take()
            .ok_or(PairingError::InvalidState("ephemeral key missing".into()))?;

        let shared = ephemeral.diffie_hellman(&device_public)?;
        let verify_key = hkdf::derive_pair_verify_key(&shared)?;

        let opened = decrypt_with_nonce(&verify_key, &nonce_from_string(PV_MSG02_NONCE), sealed)
            .map_err(|_| Error::Auth(AuthError::TagMismatch))?;

        let inner = Tlv8::parse(&opened).map_err(|e| {
            Error::Pairing(PairingError::Protocol(format!("M2 inner TLV: {e}")))
        })?;

        let peer_id = inner
            .get(TlvTag::Identifier)
            .ok_or(PairingError::MissingTag(TlvTag::Identifier as u8))?;
        let signature: [u8; 64] = inner
            .get(TlvTag::Signature)
            .ok_or(PairingError::MissingTag(TlvTag::Signature as u8))?
            .try_into()
            .map_err(|_| {
                Error::Pairing(PairingError::Protocol("M2 signature is not 64 bytes".into()))
            })?;

        // The device must be the one we paired with.
        if peer_id != self.credentials.remote_peer_id.as_bytes() {
            return Err(AuthError::PeerMismatch {
                expected: self.credentials.remote_peer_id.clone(),
                actual: String::from_utf8_lossy(peer_id).into_owned(),
            }
            .into());
        }

        // Device signs: device_eph || peer_id || client_eph.
        let mut message = Vec::with_capacity(64 + peer_id.len());
        message.extend_from_slice(&device_public);
        message.extend_from_slice(peer_id);
        message.extend_from_slice(&client_public);

        ed25519::verify(&self.credentials.remote_public_key, &message, &signature)
            .map_err(|_| Error::Auth(AuthError::SignatureInvalid))?;

        // Client signs back: client_eph || pairing_id || device_eph.
        let mut message = Vec::with_capacity(64 + self.credentials.pairing_id.len());
        message.extend_from_slice(&client_public);
        message.extend_from_slice(self.credentials.pairing_id.as_bytes());
        message.extend_from_slice(&device_public);
        let signature = self.identity.sign(&message);

        let mut inner = Tlv8::new();
        inner.set(
            TlvTag::Identifier,
            self.credentials.pairing_id.as_bytes().to_vec(),
        );
        inner.set(TlvTag::Signature, signature.to_vec());

        let sealed = encrypt_with_nonce(
            &verify_key,
            &nonce_from_string(PV_MSG03_NONCE),
            &inner.encode(),
        )?;

        let mut tlv = Tlv8::new();
        tlv.set(TlvTag::SeqNo, vec![0x03]);
        tlv.set(TlvTag::EncryptedData, sealed);

        self.shared_secret = Some(SharedSecret::new(shared.to_vec()));
        self.state = PairVerifyState::Done;
        debug!("pair-verify complete");
        Ok(tlv.encode())
    }

    /// Derive the per-session read/write keys after M3 has been produced.
    pub fn into_session_keys(self) -> Result<SessionKeys> {
        if self.state != PairVerifyState::Done {
            return Err(
                PairingError::InvalidState("verify exchange is not complete".into()).into(),
            );
        }
        let shared = self
            .shared_secret
            .as_ref()
            .ok_or(PairingError::InvalidState("shared secret missing".into()))?;
        Ok(SessionKeys::derive(shared)?)
    }
}
