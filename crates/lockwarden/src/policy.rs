//! signing policy gate
//!
//! sits in front of the signing provider. signing is allowed when:
//! - policy is disabled, or
//! - a grant was presented this session, or
//! - the path is the exempt device-authentication path (needed to sign
//!   grant requests before any grant exists)
//!
//! everything else is refused and logged as a security event; the signer is
//! never reached.

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::PolicyConfig;
use crate::crypto::{DerivationPath, Signature, SignatureProvider};
use crate::Result;

/// result of a policy-gated signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutcome {
    Success(Signature),
    PolicyViolation,
    SigningError,
}

impl SignOutcome {
    pub fn signature(&self) -> Option<&Signature> {
        match self {
            Self::Success(sig) => Some(sig),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyStatus {
    pub enabled: bool,
    pub grant_presented: bool,
    pub exempt_path: String,
}

/// process-wide policy state, owned by the authorization context
#[derive(Debug, Clone)]
pub struct PolicyGate {
    enabled: bool,
    grant_presented: bool,
    exempt_path: DerivationPath,
}

impl PolicyGate {
    /// enabled gate with no grant presented
    pub fn new(exempt_path: DerivationPath) -> Self {
        Self {
            enabled: true,
            grant_presented: false,
            exempt_path,
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        let mut gate = Self::new(config.exempt_path()?);
        gate.enabled = config.enabled;
        Ok(gate)
    }

    /// whether signing at `path` is currently allowed
    pub fn allows(&self, path: &DerivationPath) -> bool {
        !self.enabled || self.grant_presented || *path == self.exempt_path
    }

    /// sign `digest` with `key` if policy allows `path`
    pub fn sign_with_policy<P: SignatureProvider>(
        &self,
        provider: &P,
        key: &P::Key,
        path: &DerivationPath,
        digest: &[u8; 32],
    ) -> SignOutcome {
        if !self.allows(path) {
            return self.refuse(path);
        }

        match provider.sign(key, digest) {
            Ok(sig) => SignOutcome::Success(sig),
            Err(e) => {
                error!(%path, error = %e, "signing failed");
                SignOutcome::SigningError
            }
        }
    }

    /// log the refusal as a security event
    pub fn refuse(&self, path: &DerivationPath) -> SignOutcome {
        warn!(
            target: "lockwarden::security",
            %path,
            "signing refused: no grant presented this session"
        );
        SignOutcome::PolicyViolation
    }

    /// called by the orchestration layer after a grant verified
    pub fn present_grant(&mut self) {
        self.grant_presented = true;
        info!("grant presented, policy satisfied for this session");
    }

    /// forget the presented grant
    pub fn end_session(&mut self) {
        self.grant_presented = false;
    }

    pub fn disable(&mut self) {
        warn!(target: "lockwarden::security", "signing policy disabled");
        self.enabled = false;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn grant_presented(&self) -> bool {
        self.grant_presented
    }

    pub fn exempt_path(&self) -> &DerivationPath {
        &self.exempt_path
    }

    pub fn status(&self) -> PolicyStatus {
        PolicyStatus {
            enabled: self.enabled,
            grant_presented: self.grant_presented,
            exempt_path: self.exempt_path.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::crypto::{Ed25519Provider, PublicKey};
    use crate::Error;

    /// provider that counts sign calls and can be told to fail
    struct CountingProvider {
        inner: Ed25519Provider,
        calls: Cell<usize>,
        fail: bool,
    }

    impl CountingProvider {
        fn new(fail: bool) -> Self {
            Self {
                inner: Ed25519Provider::from_seed([3u8; 32]),
                calls: Cell::new(0),
                fail,
            }
        }
    }

    impl SignatureProvider for CountingProvider {
        type Key = <Ed25519Provider as SignatureProvider>::Key;

        fn derive_key(&self, path: &DerivationPath) -> Result<Self::Key> {
            self.inner.derive_key(path)
        }

        fn public_key(&self, key: &Self::Key) -> PublicKey {
            self.inner.public_key(key)
        }

        fn sign(&self, key: &Self::Key, digest: &[u8; 32]) -> Result<Signature> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return Err(Error::Internal("secure element busy".into()));
            }
            self.inner.sign(key, digest)
        }

        fn verify(&self, public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
            self.inner.verify(public_key, message, signature)
        }

        fn random(&self, buf: &mut [u8]) -> bool {
            self.inner.random(buf)
        }
    }

    fn paths() -> (DerivationPath, DerivationPath) {
        ("m/7477'/0'".parse().unwrap(), "m/84'/0'/0'/0/0".parse().unwrap())
    }

    #[test]
    fn test_exempt_path_always_signs() {
        let (exempt, _) = paths();
        let gate = PolicyGate::new(exempt.clone());
        let provider = CountingProvider::new(false);
        let key = provider.derive_key(&exempt).unwrap();

        let out = gate.sign_with_policy(&provider, &key, &exempt, &[1u8; 32]);
        let sig = out.signature().unwrap();
        assert!(provider.verify(&provider.public_key(&key), &[1u8; 32], sig));
    }

    #[test]
    fn test_sensitive_path_refused_without_grant() {
        let (exempt, wallet) = paths();
        let gate = PolicyGate::new(exempt);
        let provider = CountingProvider::new(false);
        let key = provider.derive_key(&wallet).unwrap();

        let out = gate.sign_with_policy(&provider, &key, &wallet, &[1u8; 32]);
        assert_eq!(out, SignOutcome::PolicyViolation);
        assert_eq!(provider.calls.get(), 0);
    }

    #[test]
    fn test_prefix_of_exempt_path_is_not_exempt() {
        let (exempt, _) = paths();
        let gate = PolicyGate::new(exempt);
        assert!(!gate.allows(&"m/7477'".parse().unwrap()));
        assert!(!gate.allows(&"m/7477'/0'/0".parse().unwrap()));
        assert!(!gate.allows(&"m/7477'/0".parse().unwrap()));
    }

    #[test]
    fn test_grant_unlocks_session() {
        let (exempt, wallet) = paths();
        let mut gate = PolicyGate::new(exempt);
        let provider = CountingProvider::new(false);
        let key = provider.derive_key(&wallet).unwrap();

        gate.present_grant();
        assert!(matches!(
            gate.sign_with_policy(&provider, &key, &wallet, &[2u8; 32]),
            SignOutcome::Success(_)
        ));

        gate.end_session();
        assert_eq!(
            gate.sign_with_policy(&provider, &key, &wallet, &[2u8; 32]),
            SignOutcome::PolicyViolation
        );
    }

    #[test]
    fn test_disabled_policy_signs_anything() {
        let (exempt, wallet) = paths();
        let mut gate = PolicyGate::new(exempt);
        gate.disable();
        assert!(gate.allows(&wallet));
        gate.enable();
        assert!(!gate.allows(&wallet));

        let gate = PolicyGate::from_config(&PolicyConfig {
            enabled: false,
            ..PolicyConfig::default()
        })
        .unwrap();
        assert!(gate.allows(&wallet));
    }

    #[test]
    fn test_signer_failure() {
        let (exempt, _) = paths();
        let gate = PolicyGate::new(exempt.clone());
        let provider = CountingProvider::new(true);
        let key = provider.derive_key(&exempt).unwrap();

        assert_eq!(
            gate.sign_with_policy(&provider, &key, &exempt, &[0u8; 32]),
            SignOutcome::SigningError
        );
        assert_eq!(provider.calls.get(), 1);
    }
}
