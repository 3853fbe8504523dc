// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Bearer-token issuance and handshake verification.
//!
//! The raw secret exists in memory only long enough to be shown to the
//! operator; what reaches disk is its SHA-256 digest, written with owner-only
//! permissions.  Presented tokens are hashed and compared in constant time,
//! so neither a leaked token file nor response timing gives the secret away.

use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use aria_core::UserContext;

use crate::error::NodeError;

/// Random bytes behind one bearer token.
const SECRET_LEN: usize = 32;

/// A freshly minted bearer secret.
///
/// Display it to the operator exactly once; only its [`digest`] is ever
/// persisted.
///
/// [`digest`]: BearerSecret::digest
#[must_use = "show the secret to the operator before it is dropped"]
pub struct BearerSecret(String);

impl BearerSecret {
    /// Mint a secret from the OS CSPRNG, base64url-encoded without padding.
    pub fn mint() -> Self {
        use base64::Engine;
        let mut bytes = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut bytes);
        BearerSecret(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    /// The secret string, for one-time display.
    pub fn reveal(&self) -> &str {
        &self.0
    }

    /// The form of this secret that may touch disk.
    pub fn digest(&self) -> TokenDigest {
        TokenDigest(Sha256::digest(self.0.as_bytes()).into())
    }
}

impl std::fmt::Display for BearerSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SHA-256 digest of a bearer secret.
#[derive(Clone, Debug)]
pub struct TokenDigest([u8; 32]);

/// YAML layout of the token file: a single hex-encoded `digest` field.
///
/// ```yaml
/// # ~/.config/aria/token.yaml — digest only; the secret was shown once.
/// digest: "9f86d081884c7d659a2feaa0c55ad015..."
/// ```
#[derive(Serialize, Deserialize)]
struct TokenFileLayout {
    digest: String,
}

impl TokenDigest {
    /// Constant-time check of a presented token against this digest.
    pub fn matches(&self, presented: &str) -> bool {
        let probe: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
        probe.ct_eq(&self.0).into()
    }

    /// Mint a secret, persist its digest at `path`, and hand the secret back
    /// for one-time display.
    pub fn issue_to_file(path: &Path) -> Result<BearerSecret, NodeError> {
        let secret = BearerSecret::mint();
        secret.digest().write_to(path)?;
        Ok(secret)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), NodeError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| NodeError::Config(format!("creating {}: {e}", parent.display())))?;
        }
        let layout = TokenFileLayout {
            digest: hex::encode(self.0),
        };
        let yaml =
            serde_yaml::to_string(&layout).map_err(|e| NodeError::Serde(e.to_string()))?;
        write_owner_only(path, yaml.as_bytes())
    }

    pub fn read_from(path: &Path) -> Result<Self, NodeError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("reading {}: {e}", path.display())))?;
        let layout: TokenFileLayout = serde_yaml::from_str(&text)
            .map_err(|e| NodeError::Serde(format!("{}: {e}", path.display())))?;
        let bytes = hex::decode(&layout.digest)
            .map_err(|e| NodeError::Serde(format!("{}: {e}", path.display())))?;
        let digest: [u8; 32] = bytes.try_into().map_err(|_| {
            NodeError::Serde(format!("{}: digest must be 32 bytes of hex", path.display()))
        })?;
        Ok(TokenDigest(digest))
    }
}

/// Write `data` readable by the owner only (mode 0600 on Unix), so other
/// local users cannot enumerate the digest.
fn write_owner_only(path: &Path, data: &[u8]) -> Result<(), NodeError> {
    let describe = |e: std::io::Error| NodeError::Config(format!("writing {}: {e}", path.display()));
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(describe)?;
        file.write_all(data).map_err(describe)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data).map_err(describe)?;
    }
    Ok(())
}

/// Resolves a handshake bearer token to a user context.
///
/// The real identity provider lives outside this system; the node only needs
/// this seam.  [`StaticTokenAuth`] is the single-operator implementation.
pub trait AuthProvider: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<UserContext>;
}

/// One stored digest mapped to one configured operator identity.
pub struct StaticTokenAuth {
    digest: TokenDigest,
    operator: UserContext,
}

impl StaticTokenAuth {
    pub fn new(digest: TokenDigest, operator: UserContext) -> Self {
        Self { digest, operator }
    }
}

impl AuthProvider for StaticTokenAuth {
    fn authenticate(&self, token: &str) -> Option<UserContext> {
        if self.digest.matches(token) {
            Some(self.operator.clone())
        } else {
            None
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_secrets_are_distinct_base64url() {
        let a = BearerSecret::mint();
        let b = BearerSecret::mint();
        assert_ne!(a.reveal(), b.reveal());
        // 32 bytes → 43 base64url chars, no padding.
        assert_eq!(a.reveal().len(), 43);
        assert!(!a.reveal().contains('='));
    }

    #[test]
    fn digest_matches_only_its_own_secret() {
        let secret = BearerSecret::mint();
        let digest = secret.digest();
        assert!(digest.matches(secret.reveal()));
        assert!(!digest.matches("some-other-token"));
        assert!(!digest.matches(""));
    }

    #[test]
    fn issue_then_read_verifies_the_issued_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.yaml");
        let secret = TokenDigest::issue_to_file(&path).unwrap();
        let digest = TokenDigest::read_from(&path).unwrap();
        assert!(digest.matches(secret.reveal()));
    }

    #[test]
    fn token_file_holds_the_digest_and_never_the_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.yaml");
        let secret = TokenDigest::issue_to_file(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("digest:"));
        assert!(!text.contains(secret.reveal()));
    }

    #[test]
    fn corrupt_token_file_reads_as_serde_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.yaml");
        std::fs::write(&path, "digest: \"not-hex\"\n").unwrap();
        let err = TokenDigest::read_from(&path).unwrap_err();
        assert!(matches!(err, NodeError::Serde(_)));
    }

    #[test]
    fn missing_token_file_reads_as_config_error() {
        let err = TokenDigest::read_from(Path::new("/nonexistent/aria/token.yaml")).unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[test]
    fn static_auth_yields_operator_for_valid_token_only() {
        let secret = BearerSecret::mint();
        let auth = StaticTokenAuth::new(
            secret.digest(),
            UserContext::new("operator").with_role("admin"),
        );
        let user = auth.authenticate(secret.reveal()).unwrap();
        assert_eq!(user.user_id, "operator");
        assert!(auth.authenticate("bogus").is_none());
    }
}
