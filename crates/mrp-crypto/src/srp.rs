//! SRP-6a client for PIN pairing.
//!
//! Uses the RFC 5054 3072-bit group (g=5) with SHA-512, the profile the
//! device side expects for pair-setup.

use mrp_core::error::CryptoError;
use num_bigint::{BigUint, RandBigInt};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of N in bytes (3072 bits).
const N_BYTES: usize = 384;

/// RFC 5054 3072-bit prime.
const RFC5054_N_3072: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E08",
    "8A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B",
    "302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9",
    "A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE6",
    "49286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8",
    "FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C",
    "180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D",
    "04507A33A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7D",
    "B3970F85A6E1E4C7ABF5AE8CDB0933D71E8C94E04A25619DCEE3D226",
    "1AD2EE6BF12FFA06D98A0864D87602733EC86A64521F2B18177B200C",
    "BBE117577A615D6C770988C0BAD946E208E24FA074E5AB3143DB5BFC",
    "E0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF"
);

/// Group parameters (3072-bit, RFC 5054).
pub struct SrpParams {
    pub n: BigUint,
    pub g: BigUint,
}

impl Default for SrpParams {
    fn default() -> Self {
        let n = BigUint::parse_bytes(RFC5054_N_3072.as_bytes(), 16)
            .expect("RFC 5054 prime constant is valid hex");
        Self {
            n,
            g: BigUint::from(5u32),
        }
    }
}

/// Salt and server public key from the device's M2.
pub struct SrpChallenge {
    pub salt: [u8; 16],
    pub server_public_key: Vec<u8>,
}

/// Output of processing a challenge.
pub struct SrpProof {
    /// M1 to send to the device.
    pub client_proof: Vec<u8>,
    /// K = H(S), the session key material.
    pub shared_secret: Vec<u8>,
    /// M2 the device must present back.
    pub expected_server_proof: Vec<u8>,
}

/// Client side of the exchange.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SrpClient {
    #[zeroize(skip)]
    params: SrpParams,
    identity: Vec<u8>,
    password: Vec<u8>,
    private_key: Vec<u8>,
    #[zeroize(skip)]
    public_key: BigUint,
}

impl SrpClient {
    /// Create a client; for pair-setup the identity is `Pair-Setup` and
    /// the password is the on-screen PIN.
    pub fn new(identity: &[u8], password: &[u8]) -> Self {
        let params = SrpParams::default();
        let a = OsRng.gen_biguint(256);
        let public_key = params.g.modpow(&a, &params.n);
        Self {
            params,
            identity: identity.to_vec(),
            password: password.to_vec(),
            private_key: a.to_bytes_be(),
            public_key,
        }
    }

    #[cfg(test)]
    pub fn with_private_key(identity: &[u8], password: &[u8], private_key: &[u8]) -> Self {
        let params = SrpParams::default();
        let a = BigUint::from_bytes_be(private_key);
        let public_key = params.g.modpow(&a, &params.n);
        Self {
            params,
            identity: identity.to_vec(),
            password: password.to_vec(),
            private_key: private_key.to_vec(),
            public_key,
        }
    }

    /// Client public key A, padded to 384 bytes.
    pub fn public_key(&self) -> Vec<u8> {
        pad_to_n(&self.public_key)
    }

    /// Run the exchange against the device's challenge, producing M1, the
    /// session key material, and the expected M2.
    pub fn process_challenge(&self, challenge: &SrpChallenge) -> Result<SrpProof, CryptoError> {
        let b = BigUint::from_bytes_be(&challenge.server_public_key);

        if &b % &self.params.n == BigUint::ZERO {
            return Err(CryptoError::KeyDerivation(
                "invalid server public key: B mod N = 0".to_string(),
            ));
        }

        let a = BigUint::from_bytes_be(&self.private_key);

        let u = compute_u(&self.public_key, &b);
        if u == BigUint::ZERO {
            return Err(CryptoError::KeyDerivation("invalid scrambler: u = 0".to_string()));
        }

        let x = compute_x(&challenge.salt, &self.identity, &self.password);
        let k = compute_k(&self.params);

        // S = (B - k * g^x) ^ (a + u*x) mod N
        let g_x = self.params.g.modpow(&x, &self.params.n);
        let k_gx = (&k * &g_x) % &self.params.n;
        let base = if b >= k_gx {
            (&b - &k_gx) % &self.params.n
        } else {
            (&b + &self.params.n - &k_gx) % &self.params.n
        };
        let exponent = (&a + &u * &x) % (&self.params.n - BigUint::from(1u32));
        let s = base.modpow(&exponent, &self.params.n);

        let shared_secret = sha512(&pad_to_n(&s));

        let client_proof = compute_m1(
            &self.params,
            &self.identity,
            &challenge.salt,
            &self.public_key,
            &b,
            &shared_secret,
        );

        // M2 = H(PAD(A) || M1 || K)
        let mut hasher = Sha512::new();
        hasher.update(pad_to_n(&self.public_key));
        hasher.update(&client_proof);
        hasher.update(&shared_secret);
        let expected_server_proof = hasher.finalize().to_vec();

        Ok(SrpProof {
            client_proof,
            shared_secret,
            expected_server_proof,
        })
    }

    /// Constant-time check of the device's M2.
    pub fn verify_server_proof(&self, proof: &[u8], expected: &[u8]) -> bool {
        proof.ct_eq(expected).into()
    }
}

fn sha512(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha512::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Pad a value to N_BYTES with leading zeros.
fn pad_to_n(value: &BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    if bytes.len() >= N_BYTES {
        bytes[bytes.len() - N_BYTES..].to_vec()
    } else {
        let mut padded = vec![0u8; N_BYTES - bytes.len()];
        padded.extend_from_slice(&bytes);
        padded
    }
}

/// k = H(PAD(N) || PAD(g))
fn compute_k(params: &SrpParams) -> BigUint {
    let mut hasher = Sha512::new();
    hasher.update(pad_to_n(&params.n));
    hasher.update(pad_to_n(&params.g));
    BigUint::from_bytes_be(&hasher.finalize())
}

/// u = H(PAD(A) || PAD(B))
fn compute_u(a: &BigUint, b: &BigUint) -> BigUint {
    let mut hasher = Sha512::new();
    hasher.update(pad_to_n(a));
    hasher.update(pad_to_n(b));
    BigUint::from_bytes_be(&hasher.finalize())
}

/// x = H(salt || H(identity || ":" || password))
fn compute_x(salt: &[u8], identity: &[u8], password: &[u8]) -> BigUint {
    let mut hasher = Sha512::new();
    hasher.update(identity);
    hasher.update(b":");
    hasher.update(password);
    let inner = hasher.finalize();

    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(inner);
    BigUint::from_bytes_be(&hasher.finalize())
}

/// M1 = H(H(N) xor H(g) || H(I) || salt || PAD(A) || PAD(B) || K)
///
/// H(g) is taken over the raw generator bytes (a single 0x05), not the
/// padded form; padding g here makes the device reject M3 with error 0x02.
fn compute_m1(
    params: &SrpParams,
    identity: &[u8],
    salt: &[u8],
    a: &BigUint,
    b: &BigUint,
    k: &[u8],
) -> Vec<u8> {
    let h_n = sha512(&pad_to_n(&params.n));
    let h_g = sha512(&params.g.to_bytes_be());

    let mut xor_result = [0u8; 64];
    for (i, out) in xor_result.iter_mut().enumerate() {
        *out = h_n[i] ^ h_g[i];
    }

    let h_i = sha512(identity);

    let mut hasher = Sha512::new();
    hasher.update(xor_result);
    hasher.update(h_i);
    hasher.update(salt);
    hasher.update(pad_to_n(a));
    hasher.update(pad_to_n(b));
    hasher.update(k);
    hasher.finalize().to_vec()
}

/// Device-side SRP for exercising the client against a real exchange.
#[cfg(any(test, feature = "mock"))]
pub mod mock {
    use super::*;

    /// Minimal SRP server holding a verifier for one identity/password.
    pub struct MockSrpServer {
        params: SrpParams,
        identity: Vec<u8>,
        salt: [u8; 16],
        verifier: BigUint,
        private_key: BigUint,
        public_key: BigUint,
        shared_secret: Option<Vec<u8>>,
    }

    impl MockSrpServer {
        pub fn new(identity: &[u8], password: &[u8], salt: [u8; 16]) -> Self {
            let params = SrpParams::default();

            let x = compute_x(&salt, identity, password);
            let verifier = params.g.modpow(&x, &params.n);

            let b = OsRng.gen_biguint(256);
            let k = compute_k(&params);

            // B = (k*v + g^b) mod N
            let g_b = params.g.modpow(&b, &params.n);
            let k_v = (&k * &verifier) % &params.n;
            let public_key = (&k_v + &g_b) % &params.n;

            Self {
                params,
                identity: identity.to_vec(),
                salt,
                verifier,
                private_key: b,
                public_key,
                shared_secret: None,
            }
        }

        pub fn challenge(&self) -> SrpChallenge {
            SrpChallenge {
                salt: self.salt,
                server_public_key: pad_to_n(&self.public_key),
            }
        }

        /// Compute K and the server proof M2 for the client's A.
        pub fn compute_session(&mut self, client_public: &[u8]) -> (Vec<u8>, Vec<u8>) {
            let a = BigUint::from_bytes_be(client_public);

            let u = compute_u(&a, &self.public_key);

            // S = (A * v^u)^b mod N
            let v_u = self.verifier.modpow(&u, &self.params.n);
            let base = (&a * &v_u) % &self.params.n;
            let s = base.modpow(&self.private_key, &self.params.n);

            let shared_secret = sha512(&pad_to_n(&s));

            let m1 = compute_m1(
                &self.params,
                &self.identity,
                &self.salt,
                &a,
                &self.public_key,
                &shared_secret,
            );

            let mut hasher = Sha512::new();
            hasher.update(pad_to_n(&a));
            hasher.update(&m1);
            hasher.update(&shared_secret);
            let m2 = hasher.finalize().to_vec();

            self.shared_secret = Some(shared_secret.clone());
            (shared_secret, m2)
        }

        pub fn shared_secret(&self) -> Option<&[u8]> {
            self.shared_secret.as_deref()
        }
    }
}
