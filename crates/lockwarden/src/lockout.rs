//! lockout engine
//!
//! guards the unlock secret with a retry counter, a delay table and a limit
//! response. persisted state is the source of truth:
//!
//! - wrapped secret digest and limit response in the blob store
//! - retry count in the anti-rollback counter
//! - delay-elapsed flag in the counter's side flag
//!
//! the countdown is volatile. on boot it is re-armed from the persisted retry
//! count unless the flag says the wait already elapsed, so power loss can
//! only ever restart a wait, never skip one, and a finished wait is never
//! charged twice.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::config::{LimitResponse, LockoutConfig};
use crate::counter::AntiRollbackCounter;
use crate::crypto::{ct_eq, decrypt, encrypt, labeled_digest, random_bytes};
use crate::flash::FlashRegion;
use crate::store::BlobStore;
use crate::timer::{Clock, Countdown, ExpiryFlag};
use crate::{Error, Result};

const SECRET_BLOB: &str = "lockout.secret";
const CONFIG_BLOB: &str = "lockout.config";

/// side flag once the wait finished; fresh counter entries carry 0 (pending)
const DELAY_ELAPSED: u8 = 0x1;

/// log slots one check may consume: the charge, then the clear on a match
pub const CHECK_SLOTS: usize = 2;

/// wraps the secret digest at rest under a device-held key
pub trait SecretWrapper {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>>;
}

/// chacha20poly1305 wrapper, nonce prepended to the ciphertext
pub struct AeadWrapper {
    key: Zeroizing<[u8; 32]>,
}

impl AeadWrapper {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }
}

impl SecretWrapper for AeadWrapper {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce: [u8; 12] = random_bytes();
        let mut sealed = nonce.to_vec();
        sealed.extend(encrypt(&self.key, plaintext, &nonce)?);
        Ok(sealed)
    }

    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < 12 {
            return Err(Error::Unwrap("sealed secret too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(12);
        let nonce: [u8; 12] = nonce
            .try_into()
            .map_err(|_| Error::Unwrap("bad nonce".into()))?;
        decrypt(&self.key, ciphertext, &nonce)
    }
}

/// erases device secrets held outside this core (seed, biometric templates)
pub trait DeviceEraser {
    fn erase_device_secrets(&mut self) -> Result<()>;
}

/// eraser for hosts with nothing outside the core to erase
#[derive(Debug, Default)]
pub struct NoopEraser;

impl DeviceEraser for NoopEraser {
    fn erase_device_secrets(&mut self) -> Result<()> {
        Ok(())
    }
}

/// result of a credential check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    WrongSecret,
    NoSecret,
    WaitingOnDelay,
    LimitResponseTaken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub retry_count: u16,
    pub remaining_ms: u64,
}

/// lockout state snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockoutStatus {
    pub provisioned: bool,
    pub retry_count: u16,
    pub remaining_ms: u64,
    pub delay_elapsed: bool,
    pub attempt_limit: u16,
    pub limit_response: LimitResponse,
}

#[derive(Serialize, Deserialize)]
struct PersistedConfig {
    limit_response: LimitResponse,
}

fn secret_digest(secret: &[u8]) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(labeled_digest(b"lockwarden:unlock_secret:v1", &[secret]))
}

/// lockout engine over a counter region, a blob store and a clock
pub struct LockoutEngine<F: FlashRegion, S: BlobStore, C: Clock> {
    config: LockoutConfig,
    limit_response: LimitResponse,
    counter: AntiRollbackCounter<F>,
    store: S,
    countdown: Countdown<C>,
    wrapper: Box<dyn SecretWrapper>,
    eraser: Box<dyn DeviceEraser>,
}

impl<F: FlashRegion, S: BlobStore, C: Clock> LockoutEngine<F, S, C> {
    /// open the engine and rebuild the countdown from persisted state
    pub fn open(
        config: LockoutConfig,
        counter: AntiRollbackCounter<F>,
        store: S,
        clock: C,
        wrapper: Box<dyn SecretWrapper>,
    ) -> Result<Self> {
        config.validate()?;

        let limit_response = match store.read(CONFIG_BLOB)? {
            Some(raw) => {
                let persisted: PersistedConfig = serde_json::from_slice(&raw)
                    .map_err(|e| Error::Storage(format!("lockout config: {}", e)))?;
                persisted.limit_response
            }
            None => config.limit_response,
        };

        let mut engine = Self {
            config,
            limit_response,
            counter,
            store,
            countdown: Countdown::new(clock),
            wrapper,
            eraser: Box::new(NoopEraser),
        };

        if engine.wipe_pending() {
            // check() retries this before comparing anything
            error!("interrupted limit wipe found at boot, finishing");
            if let Err(e) = engine.wipe() {
                error!(error = %e, "limit wipe still incomplete");
            }
        }

        let retry = engine.counter.count();
        if retry > 0 && engine.counter.get_flag() != DELAY_ELAPSED {
            let delay = engine.config.delay_for(retry);
            engine.countdown.start(delay);
            info!(retry, delay_ms = delay, "lockout delay re-armed from persisted state");
        }
        Ok(engine)
    }

    /// install the collaborator that erases secrets outside this core
    pub fn with_eraser(mut self, eraser: Box<dyn DeviceEraser>) -> Self {
        self.eraser = eraser;
        self
    }

    pub fn is_provisioned(&self) -> Result<bool> {
        self.store.exists(SECRET_BLOB)
    }

    /// store the unlock secret; only once per provisioning
    pub fn provision(&mut self, secret: &[u8]) -> Result<()> {
        if self.is_provisioned()? {
            return Err(Error::AlreadyProvisioned);
        }

        let wrapped = self.wrapper.seal(secret_digest(secret).as_slice())?;
        self.persist_config()?;
        self.store.write(SECRET_BLOB, &wrapped)?;

        if self.counter.count() > 0 {
            self.counter.clear()?;
        }
        self.countdown.stop();
        info!("unlock secret provisioned");
        Ok(())
    }

    /// check a candidate secret
    ///
    /// the attempt is charged on flash before the comparison and only
    /// cleared again on a match, so a failed or interrupted write never
    /// yields a free guess.
    pub fn check(&mut self, candidate: &[u8]) -> Result<CheckOutcome> {
        if self.wipe_pending() {
            self.wipe()?;
            return Ok(self.outcome(CheckStatus::NoSecret, 0));
        }

        if !self.is_provisioned()? {
            return Ok(self.outcome(CheckStatus::NoSecret, 0));
        }

        let remaining = self.remaining_delay_ms();
        if remaining > 0 {
            debug!(remaining_ms = remaining, "check refused, delay pending");
            return Ok(self.outcome(CheckStatus::WaitingOnDelay, remaining));
        }

        let stored = self.load_digest()?;

        // room for the charge and the clear that follows a match
        let free = self.counter.capacity() - self.counter.used();
        if free < CHECK_SLOTS {
            error!(free, "anti-rollback log cannot record another attempt");
            return Err(Error::CounterFull {
                capacity: self.counter.capacity(),
            });
        }

        // charge first; increment also marks the delay pending
        let retry = self.counter.increment()?;
        self.countdown.stop();

        if ct_eq(stored.as_slice(), secret_digest(candidate).as_slice()) {
            self.counter.clear()?;
            info!("unlock secret accepted");
            return Ok(self.outcome(CheckStatus::Ok, 0));
        }

        let delay = self.config.delay_for(retry);
        self.countdown.start(delay);
        warn!(retry, delay_ms = delay, "wrong unlock secret");

        if retry > self.config.attempt_limit {
            return self.take_limit_response(delay);
        }
        Ok(self.outcome(CheckStatus::WrongSecret, delay))
    }

    fn take_limit_response(&mut self, delay: u64) -> Result<CheckOutcome> {
        let retry = self.counter.count();
        match self.limit_response {
            LimitResponse::ExtendDelay => {
                warn!(retry, delay_ms = delay, "attempt limit exceeded, delay extended");
                Ok(CheckOutcome {
                    status: CheckStatus::LimitResponseTaken,
                    retry_count: retry,
                    remaining_ms: delay,
                })
            }
            LimitResponse::Wipe => {
                error!(retry, "attempt limit exceeded, wiping device");
                self.wipe()?;
                Ok(CheckOutcome {
                    status: CheckStatus::LimitResponseTaken,
                    retry_count: retry,
                    remaining_ms: 0,
                })
            }
        }
    }

    /// forgive accumulated failures (e.g. after an alternate-factor unlock)
    pub fn reset_retry_counter(&mut self) -> Result<()> {
        if self.counter.count() > 0 {
            self.counter.clear()?;
        }
        self.countdown.stop();
        info!("retry counter reset");
        Ok(())
    }

    /// erase secret, config and counter; idempotent
    pub fn wipe(&mut self) -> Result<()> {
        warn!("wiping lockout state");
        // secret first: an interrupted wipe must not leave it usable
        self.store.delete(SECRET_BLOB)?;
        self.eraser.erase_device_secrets()?;
        self.store.delete(CONFIG_BLOB)?;
        self.counter.erase()?;
        self.countdown.stop();
        self.limit_response = self.config.limit_response;
        Ok(())
    }

    /// persist a new limit response
    pub fn set_limit_response(&mut self, response: LimitResponse) -> Result<()> {
        self.limit_response = response;
        self.persist_config()?;
        info!(?response, "limit response updated");
        Ok(())
    }

    pub fn limit_response(&self) -> LimitResponse {
        self.limit_response
    }

    /// task-context expiry handling: persist the elapsed flag once the
    /// countdown ran out. returns whether anything was written
    pub fn process_timer_event(&mut self) -> Result<bool> {
        let signalled = self.countdown.expiry_flag().take();
        if !self.countdown.expired() {
            return Ok(false);
        }

        let armed = self.countdown.duration_ms();
        self.countdown.stop();
        if armed == 0 || self.counter.count() == 0 || self.counter.get_flag() == DELAY_ELAPSED {
            return Ok(false);
        }

        self.counter.set_flag(DELAY_ELAPSED)?;
        debug!(signalled, delay_ms = armed, "lockout delay elapsed");
        Ok(true)
    }

    /// handle for a timer-service callback
    pub fn expiry_flag(&self) -> ExpiryFlag {
        self.countdown.expiry_flag()
    }

    /// milliseconds before the next check is accepted
    pub fn remaining_delay_ms(&self) -> u64 {
        if self.counter.count() == 0 || self.counter.get_flag() == DELAY_ELAPSED {
            return 0;
        }
        self.countdown.remaining_ms()
    }

    pub fn retry_count(&self) -> u16 {
        self.counter.count()
    }

    pub fn status(&self) -> Result<LockoutStatus> {
        let retry_count = self.counter.count();
        Ok(LockoutStatus {
            provisioned: self.is_provisioned()?,
            retry_count,
            remaining_ms: self.remaining_delay_ms(),
            delay_elapsed: retry_count > 0 && self.counter.get_flag() == DELAY_ELAPSED,
            attempt_limit: self.config.attempt_limit,
            limit_response: self.limit_response,
        })
    }

    pub fn config(&self) -> &LockoutConfig {
        &self.config
    }

    pub fn counter(&self) -> &AntiRollbackCounter<F> {
        &self.counter
    }

    /// tear down, handing back the persisted parts
    pub fn into_parts(self) -> (AntiRollbackCounter<F>, S) {
        (self.counter, self.store)
    }

    fn outcome(&self, status: CheckStatus, remaining_ms: u64) -> CheckOutcome {
        CheckOutcome {
            status,
            retry_count: self.counter.count(),
            remaining_ms,
        }
    }

    fn persist_config(&self) -> Result<()> {
        let raw = serde_json::to_vec(&PersistedConfig {
            limit_response: self.limit_response,
        })
        .map_err(|e| Error::Storage(e.to_string()))?;
        self.store.write(CONFIG_BLOB, &raw)
    }

    /// a wipe was owed but did not finish (eraser failure or power loss)
    fn wipe_pending(&self) -> bool {
        self.limit_response == LimitResponse::Wipe && self.counter.count() > self.config.attempt_limit
    }

    fn load_digest(&self) -> Result<Zeroizing<Vec<u8>>> {
        let wrapped = self
            .store
            .read(SECRET_BLOB)?
            .ok_or_else(|| Error::Storage("unlock secret vanished".into()))?;
        Ok(Zeroizing::new(self.wrapper.unseal(&wrapped)?))
    }
}
