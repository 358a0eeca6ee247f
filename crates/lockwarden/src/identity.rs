//! device identity source

use crate::Result;

/// device id length in bytes
pub const DEVICE_ID_LEN: usize = 8;

pub type DeviceId = [u8; DEVICE_ID_LEN];

/// reads the fixed-length device identifier (e.g. the mcu serial)
pub trait IdentitySource {
    fn read_device_id(&self) -> Result<DeviceId>;
}

/// identity fixed at construction
#[derive(Debug, Clone, Copy)]
pub struct StaticIdentity(pub DeviceId);

impl IdentitySource for StaticIdentity {
    fn read_device_id(&self) -> Result<DeviceId> {
        Ok(self.0)
    }
}
