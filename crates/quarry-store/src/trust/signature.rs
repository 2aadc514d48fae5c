use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::{Signature, Verifier as _, VerifyingKey};
use sha2::{Digest as _, Sha256};

use crate::error::{Result, StoreError};

const RAW_LABEL: &str = "ED25519 PUBLIC KEY";
const PKIX_LABEL: &str = "PUBLIC KEY";

/// Parse a PEM-encoded Ed25519 public key.
///
/// Two block types are accepted: `ED25519 PUBLIC KEY` carrying the raw
/// 32-byte key, and `PUBLIC KEY` carrying a PKIX SubjectPublicKeyInfo
/// document. Anything else fails with [`StoreError::BadKeyFormat`].
pub fn parse_public_key_pem(pem: &[u8]) -> Result<VerifyingKey> {
    let text = std::str::from_utf8(pem)
        .map_err(|_| StoreError::BadKeyFormat("key is not valid UTF-8".into()))?;
    let (label, body) = decode_pem_body(text)?;
    match label.as_str() {
        RAW_LABEL => {
            let raw: &[u8; 32] = body.as_slice().try_into().map_err(|_| {
                StoreError::BadKeyFormat(format!("raw key must be 32 bytes, got {}", body.len()))
            })?;
            VerifyingKey::from_bytes(raw)
                .map_err(|_| StoreError::BadKeyFormat("not a valid Ed25519 point".into()))
        }
        PKIX_LABEL => VerifyingKey::from_public_key_der(&body)
            .map_err(|err| StoreError::BadKeyFormat(format!("invalid PKIX document: {err}"))),
        other => Err(StoreError::BadKeyFormat(format!(
            "unsupported PEM block `{other}`"
        ))),
    }
}

/// Verify a detached Ed25519 signature over `content`.
///
/// Returns the algebraic verification result; only malformed input (a
/// signature that is not 64 bytes) is an error.
pub fn verify_detached(content: &[u8], signature: &[u8], key: &VerifyingKey) -> Result<bool> {
    if signature.len() != ed25519_dalek::SIGNATURE_LENGTH {
        return Err(StoreError::BadSignatureLength(signature.len()));
    }
    let signature = Signature::from_slice(signature)
        .map_err(|_| StoreError::BadSignatureLength(signature.len()))?;
    Ok(key.verify(content, &signature).is_ok())
}

/// Keyring primary key: hex(SHA-256(raw 32-byte public key)).
pub fn fingerprint(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn decode_pem_body(text: &str) -> Result<(String, Vec<u8>)> {
    let bad = |reason: &str| StoreError::BadKeyFormat(reason.to_string());

    let mut label = None;
    let mut body = String::new();
    let mut closed = false;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("-----BEGIN ") {
            if label.is_some() {
                return Err(bad("multiple PEM blocks"));
            }
            label = Some(
                rest.strip_suffix("-----")
                    .ok_or_else(|| bad("malformed BEGIN line"))?
                    .to_string(),
            );
        } else if let Some(rest) = line.strip_prefix("-----END ") {
            let begun = label.as_deref().ok_or_else(|| bad("END before BEGIN"))?;
            let ended = rest
                .strip_suffix("-----")
                .ok_or_else(|| bad("malformed END line"))?;
            if begun != ended {
                return Err(bad("BEGIN/END labels disagree"));
            }
            closed = true;
            break;
        } else if label.is_some() {
            body.push_str(line);
        } else {
            return Err(bad("content before BEGIN line"));
        }
    }
    let label = label.ok_or_else(|| bad("no PEM block found"))?;
    if !closed {
        return Err(bad("unterminated PEM block"));
    }
    let bytes = STANDARD
        .decode(&body)
        .or_else(|_| STANDARD_NO_PAD.decode(&body))
        .map_err(|_| bad("PEM body is not valid base64"))?;
    Ok((label, bytes))
}
