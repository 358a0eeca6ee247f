//! boot-time configuration
//!
//! loaded once from json, every section has defaults. `validate` rejects
//! configs that would break lockout invariants (short or decreasing delay
//! tables, unparsable paths, malformed authority keys).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::counter::slots_for;
use crate::crypto::{DerivationPath, PublicKey};
use crate::lockout::CHECK_SLOTS;
use crate::{Error, Result};

/// what happens once the retry budget is exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LimitResponse {
    /// keep applying the capped delay forever
    #[default]
    ExtendDelay,
    /// erase every device secret
    Wipe,
}

/// which authority key endorses grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    #[default]
    Production,
    Debug,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CounterConfig {
    /// flash erase granularity
    pub page_size: usize,
    /// pages reserved for the anti-rollback log
    pub pages: usize,
}

impl Default for CounterConfig {
    /// 256 KiB, ~32k slots. a correct unlock costs 2 slots and a typo 1 or 2
    /// more, leaving room for over ten thousand unlocks without compaction
    fn default() -> Self {
        Self {
            page_size: 4096,
            pages: 64,
        }
    }
}

impl CounterConfig {
    /// entry slots the region holds
    pub fn slots(&self) -> usize {
        slots_for(self.page_size.saturating_mul(self.pages))
    }

    /// slots one full lockout run needs: every failure up to the limit
    /// response (charge plus elapsed flag each), then the unlock
    pub fn required_slots(attempt_limit: u16) -> usize {
        2 * (attempt_limit as usize + 1) + CHECK_SLOTS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockoutConfig {
    /// failures tolerated before the limit response
    pub attempt_limit: u16,
    /// required wait indexed by retry count, `attempt_limit + 1` entries
    pub delay_table_ms: Vec<u64>,
    pub limit_response: LimitResponse,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            attempt_limit: 10,
            delay_table_ms: vec![
                0,
                1_000,
                2_000,
                5_000,
                30_000,
                60_000,
                5 * 60_000,
                15 * 60_000,
                60 * 60_000,
                4 * 60 * 60_000,
                24 * 60 * 60_000,
            ],
            limit_response: LimitResponse::ExtendDelay,
        }
    }
}

impl LockoutConfig {
    /// required delay after `retry_count` failures
    pub fn delay_for(&self, retry_count: u16) -> u64 {
        let idx = retry_count.min(self.attempt_limit) as usize;
        self.delay_table_ms.get(idx).copied().unwrap_or(0)
    }

    pub fn validate(&self) -> Result<()> {
        if self.attempt_limit == 0 {
            return Err(Error::InvalidConfig("attempt_limit must be at least 1".into()));
        }
        if self.delay_table_ms.len() != self.attempt_limit as usize + 1 {
            return Err(Error::InvalidConfig(format!(
                "delay table has {} entries, attempt_limit {} needs {}",
                self.delay_table_ms.len(),
                self.attempt_limit,
                self.attempt_limit as usize + 1
            )));
        }
        if self.delay_table_ms.windows(2).any(|w| w[1] < w[0]) {
            return Err(Error::InvalidConfig("delay table must be non-decreasing".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct GrantConfig {
    pub authority: Authority,
    /// hex ed25519 public key of the production authority
    pub production_key: Option<String>,
    /// hex ed25519 public key of the debug authority
    pub debug_key: Option<String>,
}

impl GrantConfig {
    /// public key of the authority selected at boot
    pub fn authority_public_key(&self) -> Result<PublicKey> {
        let (name, key) = match self.authority {
            Authority::Production => ("production_key", &self.production_key),
            Authority::Debug => ("debug_key", &self.debug_key),
        };
        let key = key
            .as_deref()
            .ok_or_else(|| Error::InvalidConfig(format!("grant.{} not set", name)))?;
        let bytes = hex::decode(key.trim())
            .map_err(|e| Error::InvalidConfig(format!("grant.{}: {}", name, e)))?;
        bytes
            .try_into()
            .map_err(|_| Error::InvalidConfig(format!("grant.{} must be 32 bytes", name)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    pub enabled: bool,
    /// the one path that signs without a grant (device authentication key)
    pub exempt_path: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exempt_path: "m/7477'/0'".into(),
        }
    }
}

impl PolicyConfig {
    pub fn exempt_path(&self) -> Result<DerivationPath> {
        self.exempt_path.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub counter: CounterConfig,
    pub lockout: LockoutConfig,
    pub grant: GrantConfig,
    pub policy: PolicyConfig,
}

impl Config {
    /// load and validate a json config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.counter.page_size == 0 || self.counter.pages == 0 {
            return Err(Error::InvalidConfig("counter region must be non-empty".into()));
        }
        self.lockout.validate()?;
        let needed = CounterConfig::required_slots(self.lockout.attempt_limit);
        if self.counter.slots() < needed {
            return Err(Error::InvalidConfig(format!(
                "counter region holds {} slots, attempt_limit {} needs at least {}",
                self.counter.slots(),
                self.lockout.attempt_limit,
                needed
            )));
        }
        self.policy.exempt_path()?;
        if self.grant.production_key.is_some() || self.grant.debug_key.is_some() {
            self.grant.authority_public_key()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.lockout.delay_for(0), 0);
        assert_eq!(config.lockout.delay_for(1), 1_000);
        // capped at the limit
        assert_eq!(config.lockout.delay_for(500), config.lockout.delay_for(10));
    }

    #[test]
    fn test_partial_json() {
        let config = Config::from_json(
            r#"{
                "lockout": {
                    "attempt_limit": 4,
                    "delay_table_ms": [0, 1000, 2000, 4000, 8000],
                    "limit_response": "wipe"
                },
                "policy": { "enabled": false }
            }"#,
        )
        .unwrap();
        assert_eq!(config.lockout.limit_response, LimitResponse::Wipe);
        assert!(!config.policy.enabled);
        assert_eq!(config.policy.exempt_path, PolicyConfig::default().exempt_path);
        assert_eq!(config.counter, CounterConfig::default());
    }

    #[test]
    fn test_rejects_decreasing_table() {
        let lockout = LockoutConfig {
            attempt_limit: 2,
            delay_table_ms: vec![0, 5000, 1000],
            limit_response: LimitResponse::Wipe,
        };
        assert!(matches!(lockout.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_short_table() {
        let lockout = LockoutConfig {
            attempt_limit: 4,
            delay_table_ms: vec![0, 1000],
            limit_response: LimitResponse::ExtendDelay,
        };
        assert!(lockout.validate().is_err());
    }

    #[test]
    fn test_rejects_counter_too_small_for_limit() {
        let mut config = Config::default();
        assert!(config.counter.slots() > 30_000);

        // 63 slots: enough for limit 10 (24), not for limit 40 (84)
        config.counter = CounterConfig {
            page_size: 256,
            pages: 2,
        };
        config.validate().unwrap();

        config.lockout.attempt_limit = 40;
        config.lockout.delay_table_ms = vec![1000; 41];
        config.lockout.delay_table_ms[0] = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_unknown_fields() {
        assert!(Config::from_json(r#"{ "lockout": { "attempts": 3 } }"#).is_err());
    }

    #[test]
    fn test_authority_key_selection() {
        let mut grant = GrantConfig {
            authority: Authority::Debug,
            production_key: Some(hex::encode([1u8; 32])),
            debug_key: None,
        };
        assert!(grant.authority_public_key().is_err());

        grant.debug_key = Some(hex::encode([2u8; 32]));
        assert_eq!(grant.authority_public_key().unwrap(), [2u8; 32]);

        grant.authority = Authority::Production;
        assert_eq!(grant.authority_public_key().unwrap(), [1u8; 32]);

        grant.production_key = Some("abcd".into());
        assert!(grant.authority_public_key().is_err());
    }
}
