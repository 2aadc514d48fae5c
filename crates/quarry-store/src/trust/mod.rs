//! Trust subsystem: key material, signature checks, and the declarative
//! policy that classifies artifacts before the store hands them out.
//!
//! Everything here is a pure function over immutable inputs; the only
//! mutable state is [`Keyring`] insertion, which happens at construction
//! time.

pub use keyring::{Key, Keyring};
pub use policy::{TrustLevel, TrustPolicy, TrustViolation, violation};
pub use signature::{fingerprint, parse_public_key_pem, verify_detached};
pub use verifier::{Verifier, VerifyResult};

mod keyring;
mod policy;
mod signature;
mod verifier;
