//! PIN pairing (pair-setup, sequence M1-M6).
//!
//! Runs once, when the caller has no stored credentials. Four
//! request/response rounds of `CryptoPairingMessage` TLVs establish an
//! SRP-6a session keyed by the on-screen PIN, then exchange signed
//! long-term identities under the derived setup key. The result is a
//! persistent [`Credentials`] value.

use mrp_core::error::{AuthError, Error, PairingError, Result};
use mrp_core::Credentials;
use mrp_crypto::{
    chacha::{decrypt_with_nonce, encrypt_with_nonce, nonce_from_string},
    ed25519::{self, IdentityKeys},
    hkdf,
    srp::{SrpChallenge, SrpClient, SrpProof},
    tlv::{Tlv8, TlvTag},
};
use tracing::debug;

/// Username fixed by the protocol for the SRP exchange.
const SRP_USERNAME: &[u8] = b"Pair-Setup";

/// Method value for pair-setup in the M1 TLV.
const METHOD_PAIR_SETUP: u8 = 0x00;

const PS_MSG05_NONCE: &[u8] = b"PS-Msg05";
const PS_MSG06_NONCE: &[u8] = b"PS-Msg06";

/// Pair-setup state machine.
///
/// Each step checks the current state, then marks the exchange `Failed`
/// until the step completes; any early return therefore leaves the
/// machine unusable, matching the no-retry policy of the protocol.
pub struct PairSetup {
    state: PairSetupState,
    pairing_id: String,
    identity: IdentityKeys,
    srp: Option<SrpClient>,
    challenge: Option<SrpChallenge>,
    proof: Option<SrpProof>,
    setup_key: Option<[u8; 32]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairSetupState {
    Idle,
    AwaitM2,
    AwaitPin,
    AwaitM4,
    AwaitM6,
    Done,
    Failed,
}

impl PairSetup {
    /// Create a pair-setup exchange for the given stable client identity.
    ///
    /// A fresh long-term Ed25519 key pair is generated; its seed ends up
    /// in the returned credentials.
    pub fn new(pairing_id: impl Into<String>) -> Self {
        Self {
            state: PairSetupState::Idle,
            pairing_id: pairing_id.into(),
            identity: IdentityKeys::generate(),
            srp: None,
            challenge: None,
            proof: None,
            setup_key: None,
        }
    }

    pub fn state(&self) -> PairSetupState {
        self.state
    }

    /// The sequence number the next inbound TLV must carry.
    pub fn expected_seq(&self) -> Option<u8> {
        match self.state {
            PairSetupState::AwaitM2 => Some(2),
            PairSetupState::AwaitM4 => Some(4),
            PairSetupState::AwaitM6 => Some(6),
            _ => None,
        }
    }

    fn expect_state(&mut self, expected: PairSetupState, msg: &str) -> Result<()> {
        if self.state != expected {
            self.state = PairSetupState::Failed;
            return Err(PairingError::InvalidState(msg.to_string()).into());
        }
        self.state = PairSetupState::Failed;
        Ok(())
    }

    /// Generate M1: `{Method=PairSetup, Seq=1}`.
    pub fn start(&mut self) -> Result<Vec<u8>> {
        self.expect_state(PairSetupState::Idle, "M1 can only be generated from Idle")?;

        let mut tlv = Tlv8::new();
        tlv.set(TlvTag::Method, vec![METHOD_PAIR_SETUP]);
        tlv.set(TlvTag::SeqNo, vec![0x01]);

        self.state = PairSetupState::AwaitM2;
        Ok(tlv.encode())
    }

    /// Process M2: `{Seq=2, Salt, PublicKey=B}`. The PIN is needed next.
    pub fn process_m2(&mut self, pairing_data: &[u8]) -> Result<()> {
        self.expect_state(PairSetupState::AwaitM2, "M2 arrived out of order")?;

        let tlv = parse_round(pairing_data, 2)?;

        let salt = tlv
            .get(TlvTag::Salt)
            .ok_or(PairingError::MissingTag(TlvTag::Salt as u8))?;
        let salt_arr: [u8; 16] = salt
            .try_into()
            .map_err(|_| protocol_err(format!("M2 salt has length {}", salt.len())))?;

        let server_pk = tlv
            .get(TlvTag::PublicKey)
            .ok_or(PairingError::MissingTag(TlvTag::PublicKey as u8))?;

        // SRP-3072 public keys are 384 bytes; leading zeros may be
        // stripped on the wire.
        if server_pk.len() > 384 {
            return Err(protocol_err(format!(
                "M2 public key has length {}",
                server_pk.len()
            )));
        }
        let mut padded = vec![0u8; 384 - server_pk.len()];
        padded.extend_from_slice(server_pk);

        self.challenge = Some(SrpChallenge {
            salt: salt_arr,
            server_public_key: padded,
        });
        self.state = PairSetupState::AwaitPin;
        debug!("pair-setup M2 accepted, waiting for PIN");
        Ok(())
    }

    /// Run SRP with the user-supplied PIN and generate M3:
    /// `{Seq=3, PublicKey=A, Proof=M1}`.
    pub fn accept_pin(&mut self, pin: &str) -> Result<Vec<u8>> {
        self.expect_state(PairSetupState::AwaitPin, "PIN supplied before M2")?;

        let challenge = self
            .challenge
            .as_ref()
            .ok_or(PairingError::InvalidState("missing SRP challenge".into()))?;

        let srp = SrpClient::new(SRP_USERNAME, pin.as_bytes());
        let proof = srp.process_challenge(challenge)?;

        let mut tlv = Tlv8::new();
        tlv.set(TlvTag::SeqNo, vec![0x03]);
        tlv.set(TlvTag::PublicKey, srp.public_key());
        tlv.set(TlvTag::Proof, proof.client_proof.clone());

        self.srp = Some(srp);
        self.proof = Some(proof);
        self.state = PairSetupState::AwaitM4;
        Ok(tlv.encode())
    }

    /// Process M4 `{Seq=4, Proof=M2}` and generate M5
    /// `{Seq=5, EncryptedData}` carrying the signed client identity.
    pub fn process_m4(&mut self, pairing_data: &[u8]) -> Result<Vec<u8>> {
        self.expect_state(PairSetupState::AwaitM4, "M4 arrived out of order")?;

        let tlv = parse_round(pairing_data, 4)?;

        let server_proof = tlv
            .get(TlvTag::Proof)
            .ok_or(PairingError::MissingTag(TlvTag::Proof as u8))?;

        let srp = self
            .srp
            .as_ref()
            .ok_or(PairingError::InvalidState("SRP session missing".into()))?;
        let proof = self
            .proof
            .as_ref()
            .ok_or(PairingError::InvalidState("SRP proof missing".into()))?;

        if !srp.verify_server_proof(server_proof, &proof.expected_server_proof) {
            return Err(AuthError::ProofMismatch.into());
        }

        let setup_key = hkdf::derive_pair_setup_key(&proof.shared_secret)?;

        // Signed identity: HKDF prefix || pairing id || LTPK.
        let controller_x = hkdf::derive_controller_sign_key(&proof.shared_secret)?;
        let mut message = Vec::new();
        message.extend_from_slice(&controller_x);
        message.extend_from_slice(self.pairing_id.as_bytes());
        message.extend_from_slice(&self.identity.public_key());
        let signature = self.identity.sign(&message);

        let mut inner = Tlv8::new();
        inner.set(TlvTag::Identifier, self.pairing_id.as_bytes().to_vec());
        inner.set(TlvTag::PublicKey, self.identity.public_key().to_vec());
        inner.set(TlvTag::Signature, signature.to_vec());

        let nonce = nonce_from_string(PS_MSG05_NONCE);
        let sealed = encrypt_with_nonce(&setup_key, &nonce, &inner.encode())?;

        let mut tlv = Tlv8::new();
        tlv.set(TlvTag::SeqNo, vec![0x05]);
        tlv.set(TlvTag::EncryptedData, sealed);

        self.setup_key = Some(setup_key);
        self.state = PairSetupState::AwaitM6;
        Ok(tlv.encode())
    }

    /// Process M6 `{Seq=6, EncryptedData}` and finish, yielding the
    /// long-term credentials.
    pub fn process_m6(&mut self, pairing_data: &[u8]) -> Result<Credentials> {
        self.expect_state(PairSetupState::AwaitM6, "M6 arrived out of order")?;

        let tlv = parse_round(pairing_data, 6)?;

        let sealed = tlv
            .get(TlvTag::EncryptedData)
            .ok_or(PairingError::MissingTag(TlvTag::EncryptedData as u8))?;

        let setup_key = self
            .setup_key
            .as_ref()
            .ok_or(PairingError::InvalidState("setup key missing".into()))?;
        let proof = self
            .proof
            .as_ref()
            .ok_or(PairingError::InvalidState("SRP proof missing".into()))?;

        let nonce = nonce_from_string(PS_MSG06_NONCE);
        let opened = decrypt_with_nonce(setup_key, &nonce, sealed)
            .map_err(|_| Error::Auth(AuthError::TagMismatch))?;

        let inner = Tlv8::parse(&opened)
            .map_err(|e| protocol_err(format!("M6 inner TLV: {e}")))?;

        let peer_id = inner
            .get(TlvTag::Identifier)
            .ok_or(PairingError::MissingTag(TlvTag::Identifier as u8))?;
        let peer_pk: [u8; 32] = inner
            .get(TlvTag::PublicKey)
            .ok_or(PairingError::MissingTag(TlvTag::PublicKey as u8))?
            .try_into()
            .map_err(|_| protocol_err("M6 public key is not 32 bytes".into()))?;
        let peer_sig: [u8; 64] = inner
            .get(TlvTag::Signature)
            .ok_or(PairingError::MissingTag(TlvTag::Signature as u8))?
            .try_into()
            .map_err(|_| protocol_err("M6 signature is not 64 bytes".into()))?;

        let accessory_x = hkdf::derive_accessory_sign_key(&proof.shared_secret)?;
        let mut message = Vec::new();
        message.extend_from_slice(&accessory_x);
        message.extend_from_slice(peer_id);
        message.extend_from_slice(&peer_pk);

        ed25519::verify(&peer_pk, &message, &peer_sig)
            .map_err(|_| Error::Auth(AuthError::SignatureInvalid))?;

        let peer_id = String::from_utf8(peer_id.to_vec())
            .map_err(|_| protocol_err("M6 identifier is not valid UTF-8".into()))?;

        self.state = PairSetupState::Done;
        debug!(peer_id = %peer_id, "pair-setup complete");

        Ok(Credentials::new(
            self.pairing_id.clone(),
            self.identity.seed(),
            peer_id,
            peer_pk,
        ))
    }
}

/// Parse a round's TLV, checking for a device error code and the expected
/// sequence number.
fn parse_round(pairing_data: &[u8], expected_seq: u8) -> Result<Tlv8> {
    let tlv = Tlv8::parse(pairing_data)
        .map_err(|e| protocol_err(format!("pairing TLV: {e}")))?;

    if let Some(code) = tlv.error() {
        return Err(AuthError::Rejected(code).into());
    }

    match tlv.seq() {
        Some(seq) if seq == expected_seq => Ok(tlv),
        other => Err(PairingError::SequenceMismatch {
            expected: expected_seq,
            actual: other.unwrap_or(0),
        }
        .into()),
    }
}

fn protocol_err(msg: String) -> Error {
    PairingError::Protocol(msg).into()
}
