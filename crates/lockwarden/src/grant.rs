//! grant protocol
//!
//! lets a remote authority authorize one named action on one device:
//!
//! 1. device creates a request: version, action, device id, fresh challenge,
//!    signed with the device authentication key
//! 2. authority endorses the exact request bytes, producing a grant
//! 3. device checks the grant embeds its own outstanding request byte for
//!    byte, then checks the authority signature, then runs the action hook
//!
//! the byte-for-byte comparison is what stops replay of stale requests and
//! substitution of another device's request: any other challenge, device id
//! or device signature is a mismatch before the signature is even looked at.
//!
//! wire layout:
//!
//! ```text
//! request (90):  version:1 | action:1 | device_id:8 | challenge:16 | sig:64
//! grant  (155):  version:1 | request:90 | sig:64
//! ```

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::crypto::{ct_eq, labeled_digest, PublicKey, Signature, SignatureProvider};
use crate::identity::{DeviceId, IdentitySource, DEVICE_ID_LEN};
use crate::policy::{PolicyGate, SignOutcome};
use crate::store::BlobStore;
use crate::{Error, Result};

pub const GRANT_PROTOCOL_VERSION: u8 = 1;
pub const CHALLENGE_LEN: usize = 16;
pub const SIGNATURE_LEN: usize = 64;
pub const REQUEST_LEN: usize = 2 + DEVICE_ID_LEN + CHALLENGE_LEN + SIGNATURE_LEN;
pub const GRANT_LEN: usize = 1 + REQUEST_LEN + SIGNATURE_LEN;

const REQUEST_LABEL: &[u8] = b"LWGrantReq";
const GRANT_LABEL: &[u8] = b"LWGrant";

/// grantable actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Action {
    /// reset biometric enrollment; spans a reboot before completing
    FingerprintReset = 1,
    /// authorize signing of a pending transaction
    TransactionVerification = 2,
}

impl Action {
    pub const ALL: [Action; 2] = [Action::FingerprintReset, Action::TransactionVerification];

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::FingerprintReset),
            2 => Some(Self::TransactionVerification),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// whether the outstanding request must survive a reboot
    pub fn persists(self) -> bool {
        match self {
            Self::FingerprintReset => true,
            Self::TransactionVerification => false,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::FingerprintReset => "fingerprint_reset",
            Self::TransactionVerification => "transaction_verification",
        }
    }

    fn blob_name(self) -> String {
        format!("grant_request.{}", self.name())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| Error::InvalidEncoding(format!("unknown action {:?}", s)))
    }
}

/// per-action hooks registered by the orchestration layer
///
/// one method per action so a new action cannot be added without a handler.
pub trait GrantActions {
    fn fingerprint_reset(&mut self);
    fn transaction_verification(&mut self);
}

fn perform(actions: &mut dyn GrantActions, action: Action) {
    match action {
        Action::FingerprintReset => actions.fingerprint_reset(),
        Action::TransactionVerification => actions.transaction_verification(),
    }
}

/// device-originated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRequest {
    pub version: u8,
    /// raw action id, see [`GrantRequest::action`]
    pub action: u8,
    pub device_id: DeviceId,
    pub challenge: [u8; CHALLENGE_LEN],
    pub signature: Signature,
}

impl GrantRequest {
    pub fn action(&self) -> Option<Action> {
        Action::from_u8(self.action)
    }

    /// digest the device signs: label || every field before the signature
    pub fn signed_digest(&self) -> [u8; 32] {
        labeled_digest(
            REQUEST_LABEL,
            &[&[self.version, self.action][..], &self.device_id[..], &self.challenge[..]],
        )
    }

    pub fn to_bytes(&self) -> [u8; REQUEST_LEN] {
        let mut out = [0u8; REQUEST_LEN];
        out[0] = self.version;
        out[1] = self.action;
        let mut at = 2;
        out[at..at + DEVICE_ID_LEN].copy_from_slice(&self.device_id);
        at += DEVICE_ID_LEN;
        out[at..at + CHALLENGE_LEN].copy_from_slice(&self.challenge);
        at += CHALLENGE_LEN;
        out[at..].copy_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let raw: &[u8; REQUEST_LEN] = raw.try_into().map_err(|_| {
            Error::InvalidEncoding(format!("grant request is {} bytes, expected {}", raw.len(), REQUEST_LEN))
        })?;
        Ok(Self::decode(raw))
    }

    fn decode(raw: &[u8; REQUEST_LEN]) -> Self {
        let mut device_id = [0u8; DEVICE_ID_LEN];
        let mut challenge = [0u8; CHALLENGE_LEN];
        let mut signature = [0u8; SIGNATURE_LEN];
        let mut at = 2;
        device_id.copy_from_slice(&raw[at..at + DEVICE_ID_LEN]);
        at += DEVICE_ID_LEN;
        challenge.copy_from_slice(&raw[at..at + CHALLENGE_LEN]);
        at += CHALLENGE_LEN;
        signature.copy_from_slice(&raw[at..]);
        Self {
            version: raw[0],
            action: raw[1],
            device_id,
            challenge,
            signature,
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim()).map_err(|e| Error::InvalidEncoding(e.to_string()))?;
        Self::from_bytes(&raw)
    }
}

/// authority endorsement of a verbatim request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub version: u8,
    pub request: [u8; REQUEST_LEN],
    pub signature: Signature,
}

impl Grant {
    /// the embedded request
    pub fn request(&self) -> GrantRequest {
        GrantRequest::decode(&self.request)
    }

    /// digest the authority signs: label || version || request
    pub fn signed_digest(&self) -> [u8; 32] {
        labeled_digest(GRANT_LABEL, &[&[self.version][..], &self.request[..]])
    }

    pub fn to_bytes(&self) -> [u8; GRANT_LEN] {
        let mut out = [0u8; GRANT_LEN];
        out[0] = self.version;
        out[1..1 + REQUEST_LEN].copy_from_slice(&self.request);
        out[1 + REQUEST_LEN..].copy_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != GRANT_LEN {
            return Err(Error::InvalidEncoding(format!(
                "grant is {} bytes, expected {}",
                raw.len(),
                GRANT_LEN
            )));
        }
        let mut request = [0u8; REQUEST_LEN];
        let mut signature = [0u8; SIGNATURE_LEN];
        request.copy_from_slice(&raw[1..1 + REQUEST_LEN]);
        signature.copy_from_slice(&raw[1 + REQUEST_LEN..]);
        Ok(Self {
            version: raw[0],
            request,
            signature,
        })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim()).map_err(|e| Error::InvalidEncoding(e.to_string()))?;
        Self::from_bytes(&raw)
    }
}

/// authority side: endorse a request
pub fn sign_grant<P: SignatureProvider>(
    provider: &P,
    authority_key: &P::Key,
    request: &GrantRequest,
) -> Result<Grant> {
    let mut grant = Grant {
        version: GRANT_PROTOCOL_VERSION,
        request: request.to_bytes(),
        signature: [0u8; SIGNATURE_LEN],
    };
    grant.signature = provider.sign(authority_key, &grant.signed_digest())?;
    Ok(grant)
}

/// result of grant verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Ok,
    ErrorInternal,
    ErrorVersionMismatch,
    ErrorRequestMismatch,
    ErrorVerification,
}

/// device side of the grant protocol
pub struct GrantProtocol<P: SignatureProvider, I: IdentitySource, S: BlobStore> {
    provider: P,
    identity: I,
    store: S,
    authority_key: PublicKey,
    actions: Box<dyn GrantActions>,
    outstanding: Option<GrantRequest>,
}

impl<P: SignatureProvider, I: IdentitySource, S: BlobStore> GrantProtocol<P, I, S> {
    pub fn new(
        provider: P,
        identity: I,
        store: S,
        authority_key: PublicKey,
        actions: Box<dyn GrantActions>,
    ) -> Self {
        Self {
            provider,
            identity,
            store,
            authority_key,
            actions,
            outstanding: None,
        }
    }

    /// create, sign and store a fresh request for `action`
    ///
    /// replaces any outstanding request. signing goes through the policy
    /// gate on the exempt path.
    pub fn create_request(&mut self, action: Action, policy: &PolicyGate) -> Result<GrantRequest> {
        let device_id = self
            .identity
            .read_device_id()
            .map_err(|e| Error::Internal(format!("device id: {}", e)))?;

        let mut challenge = [0u8; CHALLENGE_LEN];
        if !self.provider.random(&mut challenge) {
            return Err(Error::Internal("rng failure".into()));
        }

        let mut request = GrantRequest {
            version: GRANT_PROTOCOL_VERSION,
            action: action.as_u8(),
            device_id,
            challenge,
            signature: [0u8; SIGNATURE_LEN],
        };

        let auth_path = policy.exempt_path();
        let key = self
            .provider
            .derive_key(auth_path)
            .map_err(|e| Error::Internal(format!("authentication key: {}", e)))?;
        request.signature = match policy.sign_with_policy(&self.provider, &key, auth_path, &request.signed_digest()) {
            SignOutcome::Success(sig) => sig,
            other => return Err(Error::Internal(format!("request signing: {:?}", other))),
        };

        // exactly one outstanding request
        self.delete_outstanding_request()?;
        if action.persists() {
            self.store.write(&action.blob_name(), &request.to_bytes())?;
        }
        self.outstanding = Some(request.clone());

        info!(%action, persisted = action.persists(), "grant request created");
        Ok(request)
    }

    /// verify a grant against the stored original and run its action hook
    pub fn verify_grant(&mut self, grant: &Grant) -> GrantStatus {
        let embedded = grant.request();
        let Some(action) = embedded.action() else {
            warn!(action = embedded.action, "grant for unknown action");
            return GrantStatus::ErrorInternal;
        };

        let stored = match self.load_outstanding(action) {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                warn!(%action, "no outstanding request for grant");
                return GrantStatus::ErrorInternal;
            }
            Err(e) => {
                error!(%action, error = %e, "failed to load outstanding request");
                return GrantStatus::ErrorInternal;
            }
        };

        if grant.version != GRANT_PROTOCOL_VERSION
            || embedded.version != GRANT_PROTOCOL_VERSION
            || stored.version != GRANT_PROTOCOL_VERSION
        {
            warn!(
                grant = grant.version,
                request = embedded.version,
                stored = stored.version,
                "grant protocol version mismatch"
            );
            return GrantStatus::ErrorVersionMismatch;
        }

        if !ct_eq(&stored.to_bytes(), &grant.request) {
            warn!(target: "lockwarden::security", %action, "grant does not match outstanding request");
            return GrantStatus::ErrorRequestMismatch;
        }

        if !self
            .provider
            .verify(&self.authority_key, &grant.signed_digest(), &grant.signature)
        {
            warn!(target: "lockwarden::security", %action, "grant signature invalid");
            return GrantStatus::ErrorVerification;
        }

        info!(%action, "grant verified");
        perform(self.actions.as_mut(), action);
        GrantStatus::Ok
    }

    /// drop the outstanding request, in ram and on storage
    pub fn delete_outstanding_request(&mut self) -> Result<()> {
        self.outstanding = None;
        for action in Action::ALL.into_iter().filter(|a| a.persists()) {
            self.store.delete(&action.blob_name())?;
        }
        Ok(())
    }

    /// reload a persisted outstanding request into ram after boot
    pub fn restore(&mut self) -> Result<Option<Action>> {
        for action in Action::ALL.into_iter().filter(|a| a.persists()) {
            match self.load_outstanding(action) {
                Ok(Some(_)) => {
                    info!(%action, "outstanding grant request restored");
                    return Ok(Some(action));
                }
                Ok(None) => {}
                Err(Error::InvalidEncoding(e)) => {
                    warn!(%action, error = %e, "discarding corrupt grant request");
                    self.store.delete(&action.blob_name())?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// the request held in ram, if any
    pub fn outstanding(&self) -> Option<&GrantRequest> {
        self.outstanding.as_ref()
    }

    /// public half of the device authentication key
    pub fn device_public_key(&self, policy: &PolicyGate) -> Result<PublicKey> {
        let key = self.provider.derive_key(policy.exempt_path())?;
        Ok(self.provider.public_key(&key))
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    fn load_outstanding(&mut self, action: Action) -> Result<Option<GrantRequest>> {
        if let Some(req) = &self.outstanding {
            if req.action == action.as_u8() {
                return Ok(Some(req.clone()));
            }
        }
        if !action.persists() {
            return Ok(None);
        }

        let Some(raw) = self.store.read(&action.blob_name())? else {
            return Ok(None);
        };
        let req = GrantRequest::from_bytes(&raw)?;
        self.outstanding = Some(req.clone());
        Ok(Some(req))
    }
}
