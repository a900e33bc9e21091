//! Volume types and the per-volume LEB→PEB association table.

use crate::error::{Result, UbiError};
use crate::headers::{VolHdr, UBI_VOLUME_NAME_MAX_LEN};

use std::collections::BTreeMap;

/// Upper bound on the number of volumes a device may hold
pub const UBI_MAX_VOLUMES: usize = 16;

/// These represent UBI volume types
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume whose LEBs may be rewritten in random order
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            _ => Err(()),
        }
    }
}

/// User-visible configuration of a volume
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VolumeConfig {
    /// The name of the volume, at most [`UBI_VOLUME_NAME_MAX_LEN`] bytes
    pub name: String,

    /// The type of volume
    pub vol_type: VolType,

    /// The number of LEBs addressable through this volume
    pub leb_count: u32,
}

impl VolumeConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > UBI_VOLUME_NAME_MAX_LEN {
            return Err(UbiError::InvalidArgument);
        }
        if self.leb_count == 0 {
            return Err(UbiError::InvalidArgument);
        }
        Ok(())
    }

    pub(crate) fn to_hdr(&self, vol_id: u32) -> VolHdr {
        let name_bytes = self.name.as_bytes();
        let mut name = [0u8; UBI_VOLUME_NAME_MAX_LEN];
        name[..name_bytes.len()].copy_from_slice(name_bytes);

        VolHdr::new(self.vol_type.into(), vol_id, self.leb_count, name)
    }
}

impl TryFrom<&VolHdr> for VolumeConfig {
    type Error = UbiError;

    fn try_from(hdr: &VolHdr) -> Result<Self> {
        let vol_type = VolType::try_from(hdr.vol_type).map_err(|_| UbiError::BadHeader)?;

        let name_len = hdr
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(UBI_VOLUME_NAME_MAX_LEN);
        let name = std::str::from_utf8(&hdr.name[..name_len])
            .map_err(|_| UbiError::BadHeader)?
            .to_string();

        Ok(Self {
            name,
            vol_type,
            leb_count: hdr.lebs_count,
        })
    }
}

/// In-RAM state of one volume
#[derive(Debug, Clone)]
pub(crate) struct Volume {
    /// Position of this volume's header in the persisted table, dense
    /// `0..vol_count`
    pub vol_idx: u32,

    pub config: VolumeConfig,

    /// The eraseblock association table: LEB number → PEB number
    pub eba: BTreeMap<u32, u32>,
}

impl Volume {
    pub fn new(vol_idx: u32, config: VolumeConfig) -> Self {
        Self {
            vol_idx,
            config,
            eba: BTreeMap::new(),
        }
    }
}
