//! # lockwarden
//!
//! authorization and lockout core for a battery-powered, biometric-capable
//! hardware wallet.
//!
//! decides whether a sensitive operation is allowed (unlocking, or an
//! authority-approved privileged action like resetting fingerprint
//! enrollment), rate-limits bad unlock attempts and destroys secrets once
//! the attempt budget runs out.
//!
//! ## architecture
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │         AuthContext          │
//!            └──┬────────────┬───────────┬──┘
//!               │            │           │
//!               ▼            ▼           ▼
//!        ┌──────────┐  ┌──────────┐  ┌────────┐
//!        │ lockout  │  │  grant   │─▶│ policy │──▶ signer
//!        └────┬─────┘  └────┬─────┘  └────────┘
//!             │             │
//!             ▼             ▼
//!      ┌────────────┐  ┌──────────┐
//!      │  counter   │  │ blob     │
//!      │ (raw flash)│  │ store    │
//!      └────────────┘  └──────────┘
//! ```
//!
//! ## security properties
//!
//! - no replay: a grant must embed the device's current request byte for byte
//! - no substitution: device id, challenge and device signature are all in
//!   those bytes
//! - lockout delay never decreases and survives reboot (anti-rollback log)
//! - once the attempt limit is exceeded the configured response is applied
//!   deterministically (extend delay forever, or wipe)
//!
//! ## usage
//!
//! ```rust,ignore
//! use lockwarden::{AuthContext, Collaborators, Config, CheckStatus};
//!
//! let mut ctx = AuthContext::boot(&config, collaborators)?;
//! ctx.lockout.provision(b"123456")?;
//!
//! match ctx.lockout.check(b"123456")?.status {
//!     CheckStatus::Ok => println!("unlocked"),
//!     other => println!("refused: {:?}", other),
//! }
//! ```

pub mod config;
pub mod context;
pub mod counter;
pub mod crypto;
pub mod error;
pub mod flash;
pub mod grant;
pub mod identity;
pub mod lockout;
pub mod policy;
pub mod store;
pub mod timer;

pub use config::{Authority, Config, LimitResponse};
pub use context::{AuthContext, Collaborators, DeviceStatus};
pub use counter::AntiRollbackCounter;
pub use crypto::{DerivationPath, Ed25519Provider, SignatureProvider};
pub use error::{Error, Result};
pub use flash::{FlashRegion, MemoryFlash};
pub use grant::{sign_grant, Action, Grant, GrantActions, GrantProtocol, GrantRequest, GrantStatus};
pub use identity::{IdentitySource, StaticIdentity};
pub use lockout::{AeadWrapper, CheckOutcome, CheckStatus, DeviceEraser, LockoutEngine, NoopEraser, SecretWrapper};
pub use policy::{PolicyGate, SignOutcome};
pub use store::{BlobStore, DirStore, MemoryStore};
pub use timer::{Clock, ManualClock, MonotonicClock};
