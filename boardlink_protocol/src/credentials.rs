// Credential codec: deterministic Ed25519 keys and player-id proofs.
//
// A client is configured with an opaque secret credential string. It never
// sends that string anywhere. Instead:
//
// 1. `derive_keypair` hashes the credential with SHA-256 and uses the digest
//    as the Ed25519 seed, so the same credential yields the same keypair on
//    every reconnect without storing keys.
// 2. The base64 public key is what the client presents as `credentials`, and
//    what the host binds to the player seat on first contact.
// 3. The proof of possession is the player id signed with the private key.
//    Signed messages use the "attached" layout: base64 of
//    `signature (64 bytes) || message bytes`, so the verifier can recover the
//    message and check it is exactly the claimed player id. A proof minted
//    for seat "0" therefore never authenticates seat "1".
//
// Verification never errors: bad base64, wrong lengths, corrupt signatures
// and non-UTF-8 payloads all come out as "not verified".

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{
    KEYPAIR_LENGTH, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH, Signature, Signer, SigningKey,
    VerifyingKey,
};
use sha2::{Digest, Sha256};

/// Why a base64 private key could not be used for signing.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("private key is not valid base64")]
    Encoding,
    #[error("private key must be 64 bytes, got {0}")]
    Length(usize),
    #[error("private key does not match its embedded public key")]
    Mismatch,
}

/// Signing keypair derived from a credential string.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Base64 verifying key. Doubles as the credential a client presents.
    pub fn public_key(&self) -> String {
        STANDARD.encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Base64 of the 64-byte `seed || public key` secret key.
    pub fn private_key(&self) -> String {
        STANDARD.encode(self.signing_key.to_keypair_bytes())
    }

    /// Sign `message`, returning the base64 attached signature.
    pub fn sign(&self, message: &str) -> String {
        seal(&self.signing_key, message)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Derive the keypair for `credential`. Same input, same keys.
pub fn derive_keypair(credential: &str) -> Keypair {
    let digest = Sha256::digest(credential.as_bytes());
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest);
    Keypair {
        signing_key: SigningKey::from_bytes(&seed),
    }
}

/// Sign `message` with a base64 secret key as produced by
/// [`Keypair::private_key`].
pub fn sign_message(message: &str, private_key: &str) -> Result<String, CredentialError> {
    let bytes = STANDARD
        .decode(private_key)
        .map_err(|_| CredentialError::Encoding)?;
    let keypair_bytes: [u8; KEYPAIR_LENGTH] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CredentialError::Length(bytes.len()))?;
    let signing_key =
        SigningKey::from_keypair_bytes(&keypair_bytes).map_err(|_| CredentialError::Mismatch)?;
    Ok(seal(&signing_key, message))
}

/// Check an attached signature against `public_key` and return the signed
/// message. `None` for anything malformed or not signed by that key.
pub fn open_message(signed: &str, public_key: &str) -> Option<String> {
    let signed = STANDARD.decode(signed).ok()?;
    let key_bytes: [u8; PUBLIC_KEY_LENGTH] = STANDARD.decode(public_key).ok()?.try_into().ok()?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes).ok()?;
    if signed.len() < SIGNATURE_LENGTH {
        return None;
    }
    let (signature, message) = signed.split_at(SIGNATURE_LENGTH);
    let signature = Signature::from_slice(signature).ok()?;
    verifying_key.verify_strict(message, &signature).ok()?;
    String::from_utf8(message.to_vec()).ok()
}

/// True if `signed` is `expected_player_id` signed by the key behind
/// `public_key`.
pub fn verify(signed: &str, public_key: &str, expected_player_id: &str) -> bool {
    open_message(signed, public_key).is_some_and(|message| message == expected_player_id)
}

fn seal(signing_key: &SigningKey, message: &str) -> String {
    let signature = signing_key.sign(message.as_bytes());
    let mut signed = Vec::with_capacity(SIGNATURE_LENGTH + message.len());
    signed.extend_from_slice(&signature.to_bytes());
    signed.extend_from_slice(message.as_bytes());
    STANDARD.encode(signed)
}
