//! authorization context
//!
//! one explicit object holding the lockout engine, grant protocol and policy
//! gate, built once at boot and handed to the authorization task by `&mut`.
//! the orchestration helpers here are the only place the three components
//! meet: a verified transaction grant satisfies signing policy, a wipe
//! tears down all three.

use serde::Serialize;
use tracing::{error, info};

use crate::config::Config;
use crate::counter::AntiRollbackCounter;
use crate::crypto::{DerivationPath, SignatureProvider};
use crate::flash::FlashRegion;
use crate::grant::{Action, Grant, GrantActions, GrantProtocol, GrantStatus};
use crate::identity::IdentitySource;
use crate::lockout::{DeviceEraser, LockoutEngine, LockoutStatus, SecretWrapper};
use crate::policy::{PolicyGate, PolicyStatus, SignOutcome};
use crate::store::BlobStore;
use crate::timer::Clock;
use crate::Result;

/// everything the core borrows from the rest of the firmware
pub struct Collaborators<F, S, C, P, I> {
    pub flash: F,
    pub store: S,
    pub clock: C,
    pub provider: P,
    pub identity: I,
    pub wrapper: Box<dyn SecretWrapper>,
    pub eraser: Box<dyn DeviceEraser>,
    pub actions: Box<dyn GrantActions>,
}

/// device status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub lockout: LockoutStatus,
    pub policy: PolicyStatus,
    pub outstanding_request: Option<String>,
    pub counter_used: usize,
    pub counter_capacity: usize,
}

pub struct AuthContext<F, S, C, P, I>
where
    F: FlashRegion,
    S: BlobStore + Clone,
    C: Clock,
    P: SignatureProvider,
    I: IdentitySource,
{
    pub lockout: LockoutEngine<F, S, C>,
    pub grants: GrantProtocol<P, I, S>,
    pub policy: PolicyGate,
}

impl<F, S, C, P, I> AuthContext<F, S, C, P, I>
where
    F: FlashRegion,
    S: BlobStore + Clone,
    C: Clock,
    P: SignatureProvider,
    I: IdentitySource,
{
    /// build the context from config and collaborators
    pub fn boot(config: &Config, parts: Collaborators<F, S, C, P, I>) -> Result<Self> {
        config.validate()?;

        let counter = AntiRollbackCounter::init(parts.flash)?;
        let lockout = LockoutEngine::open(
            config.lockout.clone(),
            counter,
            parts.store.clone(),
            parts.clock,
            parts.wrapper,
        )?
        .with_eraser(parts.eraser);

        let mut grants = GrantProtocol::new(
            parts.provider,
            parts.identity,
            parts.store,
            config.grant.authority_public_key()?,
            parts.actions,
        );
        grants.restore()?;
        let policy = PolicyGate::from_config(&config.policy)?;

        info!(
            authority = ?config.grant.authority,
            policy_enabled = policy.is_enabled(),
            retry_count = lockout.retry_count(),
            "authorization context ready"
        );
        Ok(Self {
            lockout,
            grants,
            policy,
        })
    }

    /// verify a grant; a verified transaction grant satisfies signing policy
    /// for the rest of the session
    pub fn authorize(&mut self, grant: &Grant) -> GrantStatus {
        let status = self.grants.verify_grant(grant);
        if status == GrantStatus::Ok && grant.request().action() == Some(Action::TransactionVerification) {
            self.policy.present_grant();
        }
        status
    }

    /// sign `digest` with the key at `path`, subject to policy
    pub fn sign(&self, path: &DerivationPath, digest: &[u8; 32]) -> SignOutcome {
        // refuse before touching key material
        if !self.policy.allows(path) {
            return self.policy.refuse(path);
        }
        let provider = self.grants.provider();
        match provider.derive_key(path) {
            Ok(key) => self.policy.sign_with_policy(provider, &key, path, digest),
            Err(e) => {
                error!(%path, error = %e, "key derivation failed");
                SignOutcome::SigningError
            }
        }
    }

    /// session over: forget the presented grant
    pub fn end_session(&mut self) {
        self.policy.end_session();
    }

    /// erase everything this core holds
    pub fn wipe(&mut self) -> Result<()> {
        self.lockout.wipe()?;
        self.grants.delete_outstanding_request()?;
        self.policy.end_session();
        Ok(())
    }

    pub fn status(&self) -> Result<DeviceStatus> {
        Ok(DeviceStatus {
            lockout: self.lockout.status()?,
            policy: self.policy.status(),
            outstanding_request: self
                .grants
                .outstanding()
                .map(|r| r.action().map(|a| a.to_string()).unwrap_or_else(|| format!("unknown({})", r.action))),
            counter_used: self.lockout.counter().used(),
            counter_capacity: self.lockout.counter().capacity(),
        })
    }
}
