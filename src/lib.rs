//! Unsorted Block Images (UBI) over a raw NOR/NAND flash partition.
//!
//! UBI sits between an MTD partition and its consumers, exposing named
//! volumes of logical erase blocks (LEBs) while hiding the physical erase
//! blocks (PEBs) underneath. Three guarantees hold across power cuts:
//!
//! - **Wear-leveling**: every erase is counted in the PEB's EC header, and
//!   allocation always picks the least-worn free PEB.
//! - **Power-fail safe metadata**: the device header and volume table are
//!   replicated across two reserved PEBs with CRC validation; commits
//!   rewrite the banks one after the other, so one parseable copy survives
//!   any interruption.
//! - **Log-structured LEB updates**: an overwrite goes to a fresh PEB and
//!   only retires the old copy in RAM, so the last durable copy is never
//!   destroyed before its replacement exists. Mount-time scanning resolves
//!   the resulting duplicates by sequence number.
//!
//! ```no_run
//! use ubi_core::{SimMtd, MtdInfo, UbiDevice, VolType, VolumeConfig};
//!
//! # fn main() -> ubi_core::Result<()> {
//! let mtd = SimMtd::new(MtdInfo {
//!     partition_size: 16 * 8192,
//!     erase_block_size: 8192,
//!     write_block_size: 16,
//! });
//!
//! let dev = UbiDevice::init(mtd)?;
//! let vol = dev.volume_create(&VolumeConfig {
//!     name: "/config".to_string(),
//!     vol_type: VolType::Dynamic,
//!     leb_count: 4,
//! })?;
//!
//! dev.leb_write(vol, 0, b"hello")?;
//! # Ok(())
//! # }
//! ```

mod device;
mod error;
mod flash;
pub mod headers;
pub mod mtd;
mod pools;
mod scan;
mod volume;
mod vtbl;

pub use device::{DeviceInfo, UbiDevice};
pub use error::{Result, UbiError};
pub use mtd::{Mtd, MtdInfo, SimMtd};
pub use volume::{VolType, VolumeConfig, UBI_MAX_VOLUMES};

#[cfg(target_os = "linux")]
pub use mtd::linux::MtdPartition;
