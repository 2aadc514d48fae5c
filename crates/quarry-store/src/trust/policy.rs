use std::collections::BTreeSet;
use std::fmt;

use super::verifier::VerifyResult;

/// How strongly an artifact's provenance is established.
///
/// Ordering matters: policies compare a classified level against their
/// configured minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrustLevel {
    /// No signature, or the signature failed to verify.
    Unverified,
    /// Signature valid, signer not in the keyring.
    Community,
    /// Signature valid, signer present in the keyring.
    Verified,
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unverified => "unverified",
            Self::Community => "community",
            Self::Verified => "verified",
        })
    }
}

/// Field names a [`TrustViolation`] can reference.
pub mod violation {
    pub const DIGEST: &str = "digest";
    pub const SIGNATURE: &str = "signature";
    pub const API_VERSION: &str = "api_version";
    pub const TRUST_LEVEL: &str = "trust_level";
}

/// One way an artifact fails the active policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustViolation {
    pub field: String,
    pub message: String,
}

impl TrustViolation {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for TrustViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Declarative trust requirements applied after verification.
///
/// The policy never short-circuits: every failed constraint becomes its own
/// violation so callers see the full picture at once.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
    min_trust_level: TrustLevel,
    allowed_api_versions: BTreeSet<String>,
    require_digest: bool,
}

impl TrustPolicy {
    pub fn new(
        min_trust_level: TrustLevel,
        allowed_api_versions: impl IntoIterator<Item = String>,
        require_digest: bool,
    ) -> Self {
        Self {
            min_trust_level,
            allowed_api_versions: allowed_api_versions.into_iter().collect(),
            require_digest,
        }
    }

    /// Signature valid and digest intact; community signers accepted.
    pub fn standard() -> Self {
        Self::new(TrustLevel::Community, [String::from("v1")], true)
    }

    /// Only keyring-backed signers, digest mandatory.
    pub fn enterprise() -> Self {
        Self::new(TrustLevel::Verified, [String::from("v1")], true)
    }

    /// Accept anything well-formed; useful during rollout.
    pub fn permissive() -> Self {
        Self::new(TrustLevel::Unverified, [String::from("v1")], false)
    }

    /// Look up one of the exposed preset names.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::standard()),
            "enterprise" => Some(Self::enterprise()),
            "permissive" => Some(Self::permissive()),
            _ => None,
        }
    }

    pub fn min_trust_level(&self) -> TrustLevel {
        self.min_trust_level
    }

    pub fn require_digest(&self) -> bool {
        self.require_digest
    }

    /// Flag an empty or unknown API version.
    pub fn check_api_version(&self, api_version: &str) -> Vec<TrustViolation> {
        if api_version.is_empty() || !self.allowed_api_versions.contains(api_version) {
            vec![TrustViolation::new(
                violation::API_VERSION,
                format!("api version `{api_version}` is not accepted by policy"),
            )]
        } else {
            Vec::new()
        }
    }

    /// Collect every policy violation present in a verification result.
    pub fn enforce(&self, result: &VerifyResult) -> Vec<TrustViolation> {
        let mut violations = Vec::new();
        if self.require_digest && !result.digest_match {
            violations.push(TrustViolation::new(
                violation::DIGEST,
                "digest verification failed but policy requires it",
            ));
        }
        if result.trust_level < self.min_trust_level {
            violations.push(TrustViolation::new(
                violation::TRUST_LEVEL,
                format!(
                    "trust level {} is below minimum {}",
                    result.trust_level, self.min_trust_level
                ),
            ));
        }
        violations
    }
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self::standard()
    }
}
