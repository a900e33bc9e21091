//! This module contains the code necessary to read, write, and manipulate the
//! four on-flash records (device, volume, EC and VID headers), with CRC
//! verification/computation.
//!
//! All records are little-endian with a trailing CRC32 computed over every
//! byte before the CRC field. Record sizes are multiples of
//! [`WRITE_BLOCK_SIZE_ALIGNMENT`] so they can be written to any flash whose
//! write granule divides that alignment.

use crc::{Crc, CRC_32_ISO_HDLC};
use deku::prelude::*;
pub use deku::{DekuContainerRead, DekuContainerWrite};

/// CRC-32/IEEE (reflected, init `0xFFFFFFFF`, xorout `0xFFFFFFFF`)
pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub const UBI_VERSION: u8 = 1;

/// Padding granule of every record; must be a multiple of the flash's write
/// block size
pub const WRITE_BLOCK_SIZE_ALIGNMENT: usize = 16;

// "UBI%", "UBI&", "UBI#", "UBI!"
pub const UBI_DEV_HDR_MAGIC: u32 = 0x55424925;
pub const UBI_VOL_HDR_MAGIC: u32 = 0x55424926;
pub const UBI_EC_HDR_MAGIC: u32 = 0x55424923;
pub const UBI_VID_HDR_MAGIC: u32 = 0x55424921;

pub const UBI_DEV_HDR_SIZE: usize = 32;
pub const UBI_VOL_HDR_SIZE: usize = 48;
pub const UBI_EC_HDR_SIZE: usize = 16;
pub const UBI_VID_HDR_SIZE: usize = 32;

/// The two PEBs reserved for the metadata banks
pub const UBI_BANK_PEB_0: u32 = 0;
pub const UBI_BANK_PEB_1: u32 = 1;
pub const UBI_RESERVED_PEBS: u32 = 2;

pub const UBI_VOLUME_NAME_MAX_LEN: usize = 16;

/// Computes, checks and repairs the trailing CRC of a record
pub trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> u32 {
        let bytes = self.to_bytes().unwrap();
        let len = bytes.len() - std::mem::size_of::<u32>();
        UBI_CRC.checksum(&bytes[..len])
    }

    fn check_crc(&self) -> bool {
        self.get_crc() == self.compute_crc()
    }

    fn fix_crc(&mut self) {
        self.set_crc(self.compute_crc())
    }

    /// Serialize the record with its current CRC
    fn encode(&self) -> Vec<u8> {
        self.to_bytes().unwrap()
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

/// Parsing of records from byteslices, with magic, version and CRC
/// verification
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + ComputeCrc {
    const MAGIC: u32;

    fn hdr_magic(&self) -> u32;
    fn hdr_version(&self) -> u8;

    fn parse(buf: &'a [u8]) -> Option<Self> {
        let (_, header) = Self::from_bytes((buf, 0)).ok()?;

        if (header.hdr_magic(), header.hdr_version()) != (Self::MAGIC, UBI_VERSION) {
            return None;
        }

        if !header.check_crc() {
            return None;
        }

        Some(header)
    }
}

/// Device header: the first record of each metadata bank
///
/// `revision` increments on every metadata commit and is what the dual-bank
/// read side compares when the banks disagree.
#[derive(Debug, Eq, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct DevHdr {
    pub magic: u32,
    pub version: u8,
    pub padding1: [u8; 3],
    pub offset: u32,
    pub size: u32,
    pub revision: u32,
    pub vol_count: u32,
    pub padding2: [u8; 4],
    pub hdr_crc: u32,
}

impl DevHdr {
    pub fn new(offset: u32, size: u32, revision: u32, vol_count: u32) -> Self {
        let mut hdr = Self {
            magic: UBI_DEV_HDR_MAGIC,
            version: UBI_VERSION,
            padding1: [0; 3],
            offset,
            size,
            revision,
            vol_count,
            padding2: [0; 4],
            hdr_crc: 0,
        };
        hdr.fix_crc();
        hdr
    }
}

/// Volume header: one entry of the volume table following the device header
#[derive(Debug, Eq, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct VolHdr {
    pub magic: u32,
    pub version: u8,
    pub vol_type: u8,
    pub padding1: [u8; 2],
    pub vol_id: u32,
    pub lebs_count: u32,
    pub padding2: [u8; 12],
    pub name: [u8; UBI_VOLUME_NAME_MAX_LEN],
    pub hdr_crc: u32,
}

impl VolHdr {
    pub fn new(vol_type: u8, vol_id: u32, lebs_count: u32, name: [u8; 16]) -> Self {
        let mut hdr = Self {
            magic: UBI_VOL_HDR_MAGIC,
            version: UBI_VERSION,
            vol_type,
            padding1: [0; 2],
            vol_id,
            lebs_count,
            padding2: [0; 12],
            name,
            hdr_crc: 0,
        };
        hdr.fix_crc();
        hdr
    }
}

/// Erase counter header: the first record of every data-region PEB, rewritten
/// each time the PEB is erased
#[derive(Debug, Eq, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct EcHdr {
    pub magic: u32,
    pub version: u8,
    pub padding: [u8; 3],
    pub ec: u32,
    pub hdr_crc: u32,
}

impl EcHdr {
    pub fn new(ec: u32) -> Self {
        let mut hdr = Self {
            magic: UBI_EC_HDR_MAGIC,
            version: UBI_VERSION,
            padding: [0; 3],
            ec,
            hdr_crc: 0,
        };
        hdr.fix_crc();
        hdr
    }
}

/// Volume identifier header: stamps a PEB with the LEB it carries
///
/// `sqnum` is a device-wide counter greater than any other VID header written
/// before it, for resolving `vol_id:lnum` collisions at mount time.
#[derive(Debug, Eq, PartialEq, Copy, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct VidHdr {
    pub magic: u32,
    pub version: u8,
    pub padding: [u8; 3],
    pub lnum: u32,
    pub vol_id: u32,
    pub sqnum: u64,
    pub data_size: u32,
    pub hdr_crc: u32,
}

impl VidHdr {
    pub fn new(vol_id: u32, lnum: u32, sqnum: u64, data_size: u32) -> Self {
        let mut hdr = Self {
            magic: UBI_VID_HDR_MAGIC,
            version: UBI_VERSION,
            padding: [0; 3],
            lnum,
            vol_id,
            sqnum,
            data_size,
            hdr_crc: 0,
        };
        hdr.fix_crc();
        hdr
    }
}

macro_rules! impl_header {
    ($record:ty, $magic:expr) => {
        impl ComputeCrc for $record {
            fn get_crc(&self) -> u32 {
                self.hdr_crc
            }
            fn set_crc(&mut self, crc: u32) {
                self.hdr_crc = crc;
            }
        }

        impl ParseHeader<'_> for $record {
            const MAGIC: u32 = $magic;

            fn hdr_magic(&self) -> u32 {
                self.magic
            }
            fn hdr_version(&self) -> u8 {
                self.version
            }
        }
    };
}

impl_header!(DevHdr, UBI_DEV_HDR_MAGIC);
impl_header!(VolHdr, UBI_VOL_HDR_MAGIC);
impl_header!(EcHdr, UBI_EC_HDR_MAGIC);
impl_header!(VidHdr, UBI_VID_HDR_MAGIC);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_crc_algorithm() {
        // CRC-32/IEEE check value
        assert_eq!(UBI_CRC.checksum(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_record_sizes() {
        let dev = DevHdr::new(0, 0, 0, 0);
        let vol = VolHdr::new(1, 0, 0, [0; 16]);
        let ec = EcHdr::new(0);
        let vid = VidHdr::new(0, 0, 0, 0);

        assert_eq!(dev.encode().len(), UBI_DEV_HDR_SIZE);
        assert_eq!(vol.encode().len(), UBI_VOL_HDR_SIZE);
        assert_eq!(ec.encode().len(), UBI_EC_HDR_SIZE);
        assert_eq!(vid.encode().len(), UBI_VID_HDR_SIZE);

        for size in [
            UBI_DEV_HDR_SIZE,
            UBI_VOL_HDR_SIZE,
            UBI_EC_HDR_SIZE,
            UBI_VID_HDR_SIZE,
        ] {
            assert_eq!(size % WRITE_BLOCK_SIZE_ALIGNMENT, 0);
        }
    }

    #[test]
    fn test_roundtrip() {
        let vid = VidHdr::new(3, 7, 0x1122334455667788, 8000);
        let bytes = vid.encode();

        assert_eq!(VidHdr::parse(&bytes), Some(vid));

        // The magic and sqnum land where the layout says they do.
        assert_eq!(&bytes[..4], &0x55424921u32.to_le_bytes());
        assert_eq!(&bytes[16..24], &0x1122334455667788u64.to_le_bytes());
    }

    #[test]
    fn test_parse_rejects() {
        let ec = EcHdr::new(5);
        let good = ec.encode();

        // Short input
        assert_eq!(EcHdr::parse(&good[..UBI_EC_HDR_SIZE - 1]), None);

        // Wrong magic
        let mut bad = good.clone();
        bad[0] ^= 0xFF;
        assert_eq!(EcHdr::parse(&bad), None);

        // Wrong version
        let mut bad = good.clone();
        bad[4] = 2;
        assert_eq!(EcHdr::parse(&bad), None);

        // CRC mismatch
        let mut bad = good.clone();
        bad[8] ^= 0x01;
        assert_eq!(EcHdr::parse(&bad), None);

        assert_eq!(EcHdr::parse(&good), Some(ec));
    }

    #[test]
    fn test_erased_region_is_not_a_header() {
        assert_eq!(VidHdr::parse(&[0xFF; UBI_VID_HDR_SIZE]), None);
    }
}
