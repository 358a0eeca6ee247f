//! anti-rollback counter
//!
//! append-only counter log in a dedicated flash region. the region starts
//! with an 8 byte header, followed by fixed 8 byte entry slots:
//!
//! ```text
//! 0      2       4       5       6        8
//! ┌──────┬───────┬───────┬───────┬────────┐
//! │magic │ count │ clear │ check │ 00 00  │
//! │ u16  │  u16  │ side  │  u8   │        │
//! └──────┴───────┴───────┴───────┴────────┘
//! ```
//!
//! the newest valid entry wins. scanning stops at the first blank slot, so
//! valid entries always form one contiguous run from the header. a torn
//! write leaves a slot that fails the magic/check/trailer test; it is skipped
//! and never counted.
//!
//! nothing is rewritten in place: clears and flag updates append fresh
//! entries, the only way back to an empty log is erasing the whole region.

use tracing::{debug, error, info, warn};

use crate::flash::{FlashRegion, ERASED};
use crate::{Error, Result};

/// region header: "LWAR" + layout version
const HEADER: [u8; 8] = [b'L', b'W', b'A', b'R', 0x01, 0x00, 0x00, 0x00];

/// entry marker
const ENTRY_MAGIC: u16 = 0x5a3c;

/// entry slot size
pub const ENTRY_LEN: usize = 8;

/// clear nibble values
const CLEAR_UNSET: u8 = 0x0;
const CLEAR_SET: u8 = 0xa;

/// largest value the 4-bit side flag holds
pub const MAX_FLAG: u8 = 0x0f;

/// entry slots a region of `region_len` bytes holds after the header
pub fn slots_for(region_len: usize) -> usize {
    region_len.saturating_sub(HEADER.len()) / ENTRY_LEN
}

/// one decoded log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    pub count: u16,
    pub cleared: bool,
    pub flag: u8,
}

impl CounterEntry {
    fn encode(&self) -> [u8; ENTRY_LEN] {
        let clear = if self.cleared { CLEAR_SET } else { CLEAR_UNSET };
        let mut raw = [0u8; ENTRY_LEN];
        raw[0..2].copy_from_slice(&ENTRY_MAGIC.to_le_bytes());
        raw[2..4].copy_from_slice(&self.count.to_le_bytes());
        raw[4] = (clear << 4) | (self.flag & MAX_FLAG);
        raw[5] = check_byte(&raw[..5]);
        raw
    }

    fn decode(raw: &[u8; ENTRY_LEN]) -> Option<Self> {
        if u16::from_le_bytes([raw[0], raw[1]]) != ENTRY_MAGIC {
            return None;
        }
        if raw[5] != check_byte(&raw[..5]) || raw[6..] != [0, 0] {
            return None;
        }
        let cleared = match raw[4] >> 4 {
            CLEAR_UNSET => false,
            CLEAR_SET => true,
            _ => return None,
        };
        Some(Self {
            count: u16::from_le_bytes([raw[2], raw[3]]),
            cleared,
            flag: raw[4] & MAX_FLAG,
        })
    }
}

fn check_byte(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0xa5u8, |acc, b| acc.rotate_left(1) ^ b)
}

fn is_blank(raw: &[u8; ENTRY_LEN]) -> bool {
    raw.iter().all(|b| *b == ERASED)
}

/// append-only counter over a raw flash region
pub struct AntiRollbackCounter<F: FlashRegion> {
    region: F,
    capacity: usize,
    latest: Option<CounterEntry>,
    next_slot: usize,
}

impl<F: FlashRegion> AntiRollbackCounter<F> {
    /// open the counter, formatting the region on first use
    pub fn init(mut region: F) -> Result<Self> {
        let page_size = region.page_size();
        if page_size == 0 || region.len() < HEADER.len() + ENTRY_LEN || region.len() % page_size != 0 {
            return Err(Error::Flash(format!(
                "region of {} bytes (page {}) cannot hold a counter log",
                region.len(),
                page_size
            )));
        }

        let mut header = [0u8; HEADER.len()];
        region.read(0, &mut header)?;
        if header != HEADER {
            info!("anti-rollback region has no header, formatting");
            format_region(&mut region)?;
        }

        let capacity = slots_for(region.len());
        let mut counter = Self {
            region,
            capacity,
            latest: None,
            next_slot: 0,
        };
        counter.scan()?;
        debug!(
            count = counter.count(),
            used = counter.next_slot,
            capacity = counter.capacity,
            "anti-rollback counter opened"
        );
        Ok(counter)
    }

    /// current count; 0 when empty or logically cleared
    pub fn count(&self) -> u16 {
        match self.latest {
            Some(entry) if !entry.cleared => entry.count,
            _ => 0,
        }
    }

    /// append count+1
    pub fn increment(&mut self) -> Result<u16> {
        let next = self.count().checked_add(1).ok_or(Error::CounterOverflow)?;
        self.append(CounterEntry {
            count: next,
            cleared: false,
            flag: 0,
        })?;
        Ok(next)
    }

    /// logical reset: keeps the prior count on flash, reads back as 0
    pub fn clear(&mut self) -> Result<()> {
        let prior = self.latest.map(|e| e.count).unwrap_or(0);
        self.append(CounterEntry {
            count: prior,
            cleared: true,
            flag: 0,
        })
    }

    /// side flag of the latest entry
    pub fn get_flag(&self) -> u8 {
        self.latest.map(|e| e.flag).unwrap_or(0)
    }

    /// set the side flag; appends a copy of the latest entry
    pub fn set_flag(&mut self, flag: u8) -> Result<()> {
        if flag > MAX_FLAG {
            return Err(Error::InvalidFlag(flag));
        }
        let base = self.latest.unwrap_or(CounterEntry {
            count: 0,
            cleared: false,
            flag: 0,
        });
        self.append(CounterEntry { flag, ..base })
    }

    /// erase the whole region and start an empty log
    pub fn erase(&mut self) -> Result<()> {
        format_region(&mut self.region)?;
        self.latest = None;
        self.next_slot = 0;
        info!("anti-rollback region erased");
        Ok(())
    }

    /// total entry slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// slots consumed, including torn ones
    pub fn used(&self) -> usize {
        self.next_slot
    }

    /// latest valid entry
    pub fn latest(&self) -> Option<CounterEntry> {
        self.latest
    }

    pub fn region(&self) -> &F {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut F {
        &mut self.region
    }

    pub fn into_region(self) -> F {
        self.region
    }

    fn slot_addr(slot: usize) -> usize {
        HEADER.len() + slot * ENTRY_LEN
    }

    /// walk the log from the header up to the first blank slot
    fn scan(&mut self) -> Result<()> {
        let mut latest = None;
        let mut slot = 0;
        let mut raw = [0u8; ENTRY_LEN];

        while slot < self.capacity {
            self.region.read(Self::slot_addr(slot), &mut raw)?;
            if is_blank(&raw) {
                break;
            }
            match CounterEntry::decode(&raw) {
                Some(entry) => latest = Some(entry),
                None => warn!(slot, "skipping invalid anti-rollback entry"),
            }
            slot += 1;
        }

        self.latest = latest;
        self.next_slot = slot;
        Ok(())
    }

    fn append(&mut self, entry: CounterEntry) -> Result<()> {
        if self.next_slot >= self.capacity {
            error!(capacity = self.capacity, "anti-rollback log full");
            return Err(Error::CounterFull {
                capacity: self.capacity,
            });
        }

        let addr = Self::slot_addr(self.next_slot);
        if let Err(e) = self.region.write_word(addr, &entry.encode()) {
            error!(slot = self.next_slot, error = %e, "anti-rollback write failed");
            // the slot may be partially programmed; resync from flash
            self.scan()?;
            return Err(e);
        }

        debug!(
            slot = self.next_slot,
            count = entry.count,
            cleared = entry.cleared,
            flag = entry.flag,
            "anti-rollback entry appended"
        );
        self.latest = Some(entry);
        self.next_slot += 1;
        Ok(())
    }
}

fn format_region<F: FlashRegion>(region: &mut F) -> Result<()> {
    let page_size = region.page_size();
    for addr in (0..region.len()).step_by(page_size) {
        region.erase_page(addr)?;
    }
    region.write_word(0, &HEADER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemoryFlash;

    fn fresh() -> AntiRollbackCounter<MemoryFlash> {
        AntiRollbackCounter::init(MemoryFlash::new(256, 2)).unwrap()
    }

    #[test]
    fn test_init_formats_once() {
        let counter = fresh();
        assert_eq!(counter.count(), 0);
        assert_eq!(counter.used(), 0);
        assert_eq!(counter.capacity(), (512 - 8) / 8);
        assert_eq!(&counter.region().as_bytes()[..8], &HEADER);

        let mut counter = counter;
        counter.increment().unwrap();

        // reopening must not format again
        let counter = AntiRollbackCounter::init(counter.into_region()).unwrap();
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn test_increment_sequence() {
        let mut counter = fresh();
        for i in 1..=5 {
            assert_eq!(counter.increment().unwrap(), i);
            assert_eq!(counter.count(), i);
        }
    }

    #[test]
    fn test_clear_resumes_from_one() {
        let mut counter = fresh();
        for _ in 0..7 {
            counter.increment().unwrap();
        }
        counter.clear().unwrap();
        assert_eq!(counter.count(), 0);

        // history is kept on flash
        let latest = counter.latest().unwrap();
        assert_eq!(latest.count, 7);
        assert!(latest.cleared);

        assert_eq!(counter.increment().unwrap(), 1);
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn test_clear_on_empty_log() {
        let mut counter = fresh();
        counter.clear().unwrap();
        assert_eq!(counter.count(), 0);
        assert_eq!(counter.increment().unwrap(), 1);
    }

    #[test]
    fn test_flag_is_independent_of_count() {
        let mut counter = fresh();
        counter.increment().unwrap();
        counter.increment().unwrap();
        counter.set_flag(1).unwrap();
        assert_eq!(counter.get_flag(), 1);
        assert_eq!(counter.count(), 2);

        // new counts start with the flag reset
        counter.increment().unwrap();
        assert_eq!(counter.get_flag(), 0);

        assert!(matches!(counter.set_flag(16), Err(Error::InvalidFlag(16))));
    }

    #[test]
    fn test_flag_survives_reopen() {
        let mut counter = fresh();
        counter.increment().unwrap();
        counter.set_flag(0x9).unwrap();
        let counter = AntiRollbackCounter::init(counter.into_region()).unwrap();
        assert_eq!(counter.get_flag(), 0x9);
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn test_torn_write_keeps_previous_value() {
        let mut counter = fresh();
        counter.increment().unwrap();
        counter.increment().unwrap();

        for torn_at in 1..ENTRY_LEN {
            counter.region_mut().power_loss_after(torn_at);
            assert!(counter.increment().is_err());
            assert_eq!(counter.count(), 2);

            let reopened = AntiRollbackCounter::init(counter.region().clone()).unwrap();
            assert_eq!(reopened.count(), 2);
        }

        // torn slots are skipped, not reused
        let used = counter.used();
        assert_eq!(counter.increment().unwrap(), 3);
        assert_eq!(counter.used(), used + 1);
    }

    #[test]
    fn test_full_region() {
        let mut counter = AntiRollbackCounter::init(MemoryFlash::new(32, 1)).unwrap();
        assert_eq!(counter.capacity(), 3);
        counter.increment().unwrap();
        counter.increment().unwrap();
        counter.increment().unwrap();
        assert!(matches!(counter.increment(), Err(Error::CounterFull { capacity: 3 })));
        assert!(matches!(counter.set_flag(1), Err(Error::CounterFull { .. })));
        assert_eq!(counter.count(), 3);
    }

    #[test]
    fn test_overflow() {
        let mut flash = MemoryFlash::new(256, 1);
        flash.write_word(0, &HEADER).unwrap();
        let top = CounterEntry {
            count: u16::MAX,
            cleared: false,
            flag: 0,
        };
        flash.write_word(8, &top.encode()).unwrap();

        let mut counter = AntiRollbackCounter::init(flash).unwrap();
        assert_eq!(counter.count(), u16::MAX);
        assert!(matches!(counter.increment(), Err(Error::CounterOverflow)));

        // a clear still lets numbering restart
        counter.clear().unwrap();
        assert_eq!(counter.increment().unwrap(), 1);
    }

    #[test]
    fn test_erase_resets_log() {
        let mut counter = fresh();
        counter.increment().unwrap();
        counter.set_flag(3).unwrap();
        counter.erase().unwrap();
        assert_eq!(counter.count(), 0);
        assert_eq!(counter.get_flag(), 0);
        assert_eq!(counter.used(), 0);

        let counter = AntiRollbackCounter::init(counter.into_region()).unwrap();
        assert_eq!(counter.count(), 0);
        assert!(counter.latest().is_none());
    }

    #[test]
    fn test_garbage_header_is_reformatted() {
        let mut flash = MemoryFlash::new(64, 1);
        flash.write_word(0, b"junkjunk").unwrap();
        flash.write_word(8, &[0u8; 8]).unwrap();
        let counter = AntiRollbackCounter::init(flash).unwrap();
        assert_eq!(counter.used(), 0);
        assert_eq!(&counter.region().as_bytes()[..8], &HEADER);
    }

    #[test]
    fn test_entry_decode_rejects_bad_clear_nibble() {
        let mut raw = CounterEntry {
            count: 4,
            cleared: false,
            flag: 2,
        }
        .encode();
        raw[4] = 0x32;
        raw[5] = check_byte(&raw[..5]);
        assert!(CounterEntry::decode(&raw).is_none());
    }
}
