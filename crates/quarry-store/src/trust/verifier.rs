use time::OffsetDateTime;

use crate::digest::Digest;

use super::keyring::Keyring;
use super::policy::{TrustLevel, TrustPolicy, TrustViolation, violation};
use super::signature::{self, parse_public_key_pem};

/// Outcome of verifying one artifact against the active policy.
///
/// Violations preserve insertion order; message stability matters to
/// callers that render them.
#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub trust_level: TrustLevel,
    pub digest_match: bool,
    pub signature_valid: bool,
    pub signer_key_fingerprint: String,
    pub signer_name: String,
    pub violations: Vec<TrustViolation>,
    pub verified_at: OffsetDateTime,
}

impl VerifyResult {
    pub fn ok(&self) -> bool {
        self.violations.is_empty() && self.digest_match
    }
}

/// Orchestrates digest, signature, and policy checks over one artifact.
#[derive(Debug, Clone, Default)]
pub struct Verifier {
    keyring: Keyring,
    policy: TrustPolicy,
}

impl Verifier {
    pub fn new(keyring: Keyring, policy: TrustPolicy) -> Self {
        Self { keyring, policy }
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    /// Run the full verification pipeline.
    ///
    /// The pipeline never returns early: malformed inputs become violations
    /// and the remaining checks still run, so callers see every failed
    /// constraint at once. `signature` and `signer_key_pem` are only
    /// consulted when both are present and non-empty.
    pub fn verify(
        &self,
        content: &[u8],
        expected_digest: &str,
        signature: Option<&[u8]>,
        signer_key_pem: Option<&[u8]>,
        api_version: &str,
    ) -> VerifyResult {
        let mut result = VerifyResult {
            trust_level: TrustLevel::Unverified,
            digest_match: false,
            signature_valid: false,
            signer_key_fingerprint: String::new(),
            signer_name: String::new(),
            violations: Vec::new(),
            verified_at: OffsetDateTime::UNIX_EPOCH,
        };

        if !expected_digest.is_empty() {
            match Digest::parse(expected_digest) {
                Ok(expected) => {
                    result.digest_match = Digest::compute(content) == expected;
                    if !result.digest_match {
                        result.violations.push(TrustViolation::new(
                            violation::DIGEST,
                            "content digest does not match expected digest",
                        ));
                    }
                }
                Err(err) => {
                    result
                        .violations
                        .push(TrustViolation::new(violation::DIGEST, err.to_string()));
                }
            }
        }

        let signer_key = match (signature, signer_key_pem) {
            (Some(sig), Some(pem)) if !sig.is_empty() && !pem.is_empty() => {
                match parse_public_key_pem(pem) {
                    Ok(key) => {
                        match signature::verify_detached(content, sig, &key) {
                            Ok(true) => result.signature_valid = true,
                            Ok(false) => result.violations.push(TrustViolation::new(
                                violation::SIGNATURE,
                                "signature verification failed",
                            )),
                            Err(err) => result
                                .violations
                                .push(TrustViolation::new(violation::SIGNATURE, err.to_string())),
                        }
                        Some(key)
                    }
                    Err(err) => {
                        result
                            .violations
                            .push(TrustViolation::new(violation::SIGNATURE, err.to_string()));
                        None
                    }
                }
            }
            _ => None,
        };

        if result.signature_valid {
            let key = signer_key.expect("signature_valid implies a parsed key");
            result.signer_key_fingerprint = signature::fingerprint(&key);
            match self.keyring.find(&result.signer_key_fingerprint) {
                Some(trusted) => {
                    result.trust_level = TrustLevel::Verified;
                    result.signer_name = trusted.name().to_string();
                }
                None => result.trust_level = TrustLevel::Community,
            }
        }

        if !api_version.is_empty() {
            result
                .violations
                .extend(self.policy.check_api_version(api_version));
        }

        let policy_violations = self.policy.enforce(&result);
        result.violations.extend(policy_violations);

        result.verified_at = OffsetDateTime::now_utc();
        result
    }
}
