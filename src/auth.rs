//! Command authorization and signature freshness checks.
//!
//! Every inbound command carries three auth fields:
//!
//! | field       | meaning                                                   |
//! |-------------|-----------------------------------------------------------|
//! | `authtype`  | selection policy: `all` or `randomselect`                 |
//! | `authdata`  | policy parameter (`randomselect`: per-mille probability)  |
//! | `signature` | base64 of `ed25519 signature (64 bytes) ‖ plaintext`      |
//!
//! The plaintext is `"<anything>|<epoch-ms>"`. A command is acted on only when
//! the policy selects this agent *and* the signature opens under the fleet
//! public key with a timestamp inside the freshness window. There is no nonce
//! tracking: a captured command replays successfully until its window closes.

use std::sync::atomic::{AtomicI64, Ordering};

use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SIGNATURE_LENGTH};
use rand::Rng;
use serde_json::Value;
use tracing::{debug, warn};

use crate::utils::now_epoch_ms;

/// Maximum allowed distance between the signer's timestamp and the
/// offset-adjusted local clock (30 minutes).
pub const FRESHNESS_WINDOW_MS: i64 = 1_800_000;

/// Upper bound of the `randomselect` draw.
const RANDOM_SELECT_RANGE: u32 = 1000;

/// Selection policy named by an envelope's `authtype`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthType {
    /// Every agent that receives the command acts on it.
    All,
    /// Each agent independently acts with probability `authdata / 1000`.
    RandomSelect,
    /// Anything else. Never authorized.
    Unknown(String),
}

impl AuthType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "all" => AuthType::All,
            "randomselect" => AuthType::RandomSelect,
            other => AuthType::Unknown(other.to_string()),
        }
    }
}

/// Decide whether the selection policy picks this agent, using the thread RNG.
pub fn authorize(auth_type: &AuthType, auth_data: &Value) -> bool {
    authorize_with(auth_type, auth_data, &mut rand::thread_rng())
}

/// Decide whether the selection policy picks this agent with an explicit RNG.
pub fn authorize_with<R: Rng + ?Sized>(auth_type: &AuthType, auth_data: &Value, rng: &mut R) -> bool {
    match auth_type {
        AuthType::All => true,
        AuthType::RandomSelect => {
            let Some(per_mille) = per_mille(auth_data) else {
                debug!(authdata = %auth_data, "randomselect authdata is not a number");
                return false;
            };
            let draw = rng.gen_range(1..=RANDOM_SELECT_RANGE);
            f64::from(draw) <= per_mille
        }
        AuthType::Unknown(name) => {
            debug!(authtype = %name, "Unknown authtype");
            false
        }
    }
}

fn per_mille(auth_data: &Value) -> Option<f64> {
    match auth_data {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Why a signature blob could not be opened.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("signature is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("signed blob is {0} bytes, shorter than a signature")]
    Truncated(usize),

    #[error("signature does not verify under the fleet key")]
    BadSignature,

    #[error("signed plaintext is not UTF-8")]
    NotUtf8,

    #[error("signed plaintext has no '|<timestamp>' suffix")]
    MissingTimestamp,

    #[error("signed timestamp '{0}' is not an integer")]
    BadTimestamp(String),
}

/// Why a configured public key was refused.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("public key is not hex: {0}")]
    NotHex(#[from] hex::FromHexError),

    #[error("public key must be 32 bytes, got {0}")]
    WrongLength(usize),

    #[error("public key is not a valid Ed25519 point: {0}")]
    NotOnCurve(#[from] ed25519_dalek::SignatureError),
}

/// Verifies signed command blobs and owns the clock offset used for
/// freshness checks.
///
/// The offset is the learned difference `local clock − signer clock` in
/// milliseconds. It is only changed through [`set_clock_offset`] and
/// [`calibrate`], so tests can pin it deterministically.
///
/// [`set_clock_offset`]: SignatureVerifier::set_clock_offset
/// [`calibrate`]: SignatureVerifier::calibrate
#[derive(Debug)]
pub struct SignatureVerifier {
    key: VerifyingKey,
    clock_offset_ms: AtomicI64,
}

impl SignatureVerifier {
    pub fn new(key: VerifyingKey, clock_offset_ms: i64) -> Self {
        Self {
            key,
            clock_offset_ms: AtomicI64::new(clock_offset_ms),
        }
    }

    pub fn clock_offset(&self) -> i64 {
        self.clock_offset_ms.load(Ordering::Relaxed)
    }

    pub fn set_clock_offset(&self, offset_ms: i64) {
        self.clock_offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    /// Align the freshness check with a signer-supplied timestamp:
    /// `offset = now − signer_ts`. Returns the new offset.
    ///
    /// Any sender able to get a `settime` command authorized can move the
    /// window for every later check.
    pub fn calibrate(&self, signer_ts_ms: i64) -> i64 {
        let offset = now_epoch_ms().saturating_sub(signer_ts_ms);
        let previous = self.clock_offset_ms.swap(offset, Ordering::Relaxed);
        warn!(
            previous_offset_ms = previous,
            new_offset_ms = offset,
            "Clock offset recalibrated"
        );
        offset
    }

    /// Check a signature against the local wall clock.
    pub fn verify(&self, signature: &str) -> bool {
        self.verify_at(signature, now_epoch_ms())
    }

    /// Check a signature as if the local clock read `now_ms`.
    pub fn verify_at(&self, signature: &str, now_ms: i64) -> bool {
        let timestamp = match self.open(signature).and_then(|p| signed_timestamp(&p)) {
            Ok(ts) => ts,
            Err(e) => {
                debug!(error = %e, "Rejected command signature");
                return false;
            }
        };

        let skew = now_ms
            .saturating_sub(self.clock_offset())
            .saturating_sub(timestamp);
        let fresh = skew.unsigned_abs() <= FRESHNESS_WINDOW_MS.unsigned_abs();
        if !fresh {
            debug!(
                signed_at_ms = timestamp,
                skew_ms = skew,
                "Rejected stale command signature"
            );
        }
        fresh
    }

    /// Recover the signed plaintext from a blob.
    pub fn open(&self, signature: &str) -> Result<String, SignatureError> {
        let blob = base64::engine::general_purpose::STANDARD.decode(signature.trim())?;
        if blob.len() < SIGNATURE_LENGTH {
            return Err(SignatureError::Truncated(blob.len()));
        }
        let (sig_bytes, message) = blob.split_at(SIGNATURE_LENGTH);
        let sig = Signature::from_slice(sig_bytes).map_err(|_| SignatureError::BadSignature)?;
        self.key
            .verify(message, &sig)
            .map_err(|_| SignatureError::BadSignature)?;
        String::from_utf8(message.to_vec()).map_err(|_| SignatureError::NotUtf8)
    }
}

fn signed_timestamp(plaintext: &str) -> Result<i64, SignatureError> {
    let (_, ts) = plaintext
        .rsplit_once('|')
        .ok_or(SignatureError::MissingTimestamp)?;
    ts.trim()
        .parse()
        .map_err(|_| SignatureError::BadTimestamp(ts.to_string()))
}

/// Produce a signature blob in the format [`SignatureVerifier::open`] accepts.
///
/// Agents never sign; this exists for command issuers and tests.
pub fn seal(key: &SigningKey, plaintext: &str) -> String {
    let sig = key.sign(plaintext.as_bytes());
    let mut blob = Vec::with_capacity(SIGNATURE_LENGTH + plaintext.len());
    blob.extend_from_slice(&sig.to_bytes());
    blob.extend_from_slice(plaintext.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(blob)
}

/// Parse a hex-encoded 32-byte Ed25519 public key.
pub fn parse_public_key(hex_key: &str) -> Result<VerifyingKey, KeyError> {
    let bytes = hex::decode(hex_key.trim())?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| KeyError::WrongLength(b.len()))?;
    Ok(VerifyingKey::from_bytes(&bytes)?)
}
