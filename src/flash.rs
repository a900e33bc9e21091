//! Typed, partition-relative flash access.
//!
//! [`Flash`] wraps the raw [`Mtd`] with the PEB arithmetic, the reserved-PEB
//! guards, record-level header I/O and the write-alignment staging policy,
//! so the rest of the core never touches a byte offset directly.

use crate::error::{Result, UbiError};
use crate::headers::{
    ComputeCrc, EcHdr, ParseHeader, VidHdr, UBI_EC_HDR_SIZE, UBI_RESERVED_PEBS, UBI_VID_HDR_SIZE,
    WRITE_BLOCK_SIZE_ALIGNMENT,
};
use crate::mtd::Mtd;

pub(crate) struct Flash<M: Mtd> {
    mtd: M,
    eb_size: usize,
    wb_size: usize,
    peb_count: u32,
}

impl<M: Mtd> Flash<M> {
    /// Validate the partition geometry and wrap the MTD
    pub fn new(mtd: M) -> Result<Self> {
        let info = mtd.info();
        let eb_size = info.erase_block_size;
        let wb_size = info.write_block_size;

        if eb_size == 0 || !eb_size.is_power_of_two() {
            return Err(UbiError::InvalidArgument);
        }
        if eb_size <= UBI_EC_HDR_SIZE + UBI_VID_HDR_SIZE {
            return Err(UbiError::InvalidArgument);
        }
        if info.partition_size == 0 || info.partition_size % eb_size != 0 {
            return Err(UbiError::InvalidArgument);
        }
        if wb_size == 0 || WRITE_BLOCK_SIZE_ALIGNMENT % wb_size != 0 {
            return Err(UbiError::InvalidArgument);
        }

        let peb_count = (info.partition_size / eb_size) as u32;
        if peb_count <= UBI_RESERVED_PEBS {
            return Err(UbiError::InvalidArgument);
        }

        Ok(Self {
            mtd,
            eb_size,
            wb_size,
            peb_count,
        })
    }

    pub fn into_mtd(self) -> M {
        self.mtd
    }

    pub fn peb_count(&self) -> u32 {
        self.peb_count
    }

    pub fn data_peb_count(&self) -> u32 {
        self.peb_count - UBI_RESERVED_PEBS
    }

    pub fn eb_size(&self) -> usize {
        self.eb_size
    }

    pub fn partition_size(&self) -> usize {
        self.eb_size * self.peb_count as usize
    }

    /// Usable payload bytes per LEB
    pub fn leb_size(&self) -> usize {
        self.eb_size - UBI_EC_HDR_SIZE - UBI_VID_HDR_SIZE
    }

    fn peb_base(&self, pnum: u32) -> usize {
        pnum as usize * self.eb_size
    }

    fn check_data_peb(&self, pnum: u32) -> Result<()> {
        if pnum < UBI_RESERVED_PEBS || pnum >= self.peb_count {
            return Err(UbiError::InvalidArgument);
        }
        Ok(())
    }

    /// Read and validate the EC header of a data-region PEB
    pub fn ec_read(&self, pnum: u32) -> Result<EcHdr> {
        self.check_data_peb(pnum)?;

        let mut buf = [0u8; UBI_EC_HDR_SIZE];
        self.mtd.read(self.peb_base(pnum), &mut buf)?;

        EcHdr::parse(&buf).ok_or(UbiError::BadHeader)
    }

    pub fn ec_write(&mut self, pnum: u32, hdr: &EcHdr) -> Result<()> {
        self.check_data_peb(pnum)?;

        self.mtd.write(self.peb_base(pnum), &hdr.encode())?;
        Ok(())
    }

    /// Read the raw VID header region; an all-`0xFF` result means the PEB has
    /// never been mapped since its last erase
    pub fn vid_read_raw(&self, pnum: u32) -> Result<[u8; UBI_VID_HDR_SIZE]> {
        self.check_data_peb(pnum)?;

        let mut buf = [0u8; UBI_VID_HDR_SIZE];
        self.mtd
            .read(self.peb_base(pnum) + UBI_EC_HDR_SIZE, &mut buf)?;
        Ok(buf)
    }

    /// Read and validate the VID header of a data-region PEB
    pub fn vid_read(&self, pnum: u32) -> Result<VidHdr> {
        let buf = self.vid_read_raw(pnum)?;
        VidHdr::parse(&buf).ok_or(UbiError::BadHeader)
    }

    pub fn vid_write(&mut self, pnum: u32, hdr: &VidHdr) -> Result<()> {
        self.check_data_peb(pnum)?;

        self.mtd
            .write(self.peb_base(pnum) + UBI_EC_HDR_SIZE, &hdr.encode())?;
        Ok(())
    }

    /// Write a LEB payload immediately after the VID header
    ///
    /// The flash only accepts whole write blocks, so a payload whose length
    /// is not a multiple of the write block size is finished with a
    /// zero-padded staging buffer: either the whole payload (when shorter
    /// than one block) or just its tail.
    pub fn data_write(&mut self, pnum: u32, buf: &[u8]) -> Result<()> {
        self.check_data_peb(pnum)?;
        if buf.len() > self.leb_size() {
            return Err(UbiError::NoSpace);
        }

        let offset = self.peb_base(pnum) + UBI_EC_HDR_SIZE + UBI_VID_HDR_SIZE;
        let wb = self.wb_size;
        let tail_len = buf.len() % wb;

        if tail_len == 0 {
            self.mtd.write(offset, buf)?;
        } else if buf.len() < wb {
            let mut stage = vec![0u8; wb];
            stage[..buf.len()].copy_from_slice(buf);
            self.mtd.write(offset, &stage)?;
        } else {
            let head_len = buf.len() - tail_len;
            self.mtd.write(offset, &buf[..head_len])?;

            let mut stage = vec![0u8; wb];
            stage[..tail_len].copy_from_slice(&buf[head_len..]);
            self.mtd.write(offset + head_len, &stage)?;
        }

        Ok(())
    }

    /// Read from a LEB payload at `offset` bytes into it
    pub fn data_read(&self, pnum: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_data_peb(pnum)?;
        if offset + buf.len() > self.leb_size() {
            return Err(UbiError::NoSpace);
        }

        let base = self.peb_base(pnum) + UBI_EC_HDR_SIZE + UBI_VID_HDR_SIZE;
        self.mtd.read(base + offset, buf)?;
        Ok(())
    }

    /// Erase a whole data-region PEB
    pub fn erase_peb(&mut self, pnum: u32) -> Result<()> {
        self.check_data_peb(pnum)?;

        self.mtd.erase(self.peb_base(pnum), self.eb_size)?;
        Ok(())
    }

    /// Read from one of the two metadata bank PEBs
    pub fn bank_read(&self, bank: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        debug_assert!(bank < UBI_RESERVED_PEBS);
        if offset + buf.len() > self.eb_size {
            return Err(UbiError::InvalidArgument);
        }

        self.mtd.read(self.peb_base(bank) + offset, buf)?;
        Ok(())
    }

    /// Erase a metadata bank PEB and write a fresh image into it
    pub fn bank_overwrite(&mut self, bank: u32, buf: &[u8]) -> Result<()> {
        debug_assert!(bank < UBI_RESERVED_PEBS);
        if buf.len() > self.eb_size {
            return Err(UbiError::NoSpace);
        }

        let base = self.peb_base(bank);
        self.mtd.erase(base, self.eb_size)?;
        self.mtd.write(base, buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mtd::{BufUtil, MtdInfo, SimMtd};

    const TEST_INFO: MtdInfo = MtdInfo {
        partition_size: 8 * 8192,
        erase_block_size: 8192,
        write_block_size: 16,
    };

    fn new_flash() -> Flash<SimMtd> {
        Flash::new(SimMtd::new(TEST_INFO)).unwrap()
    }

    #[test]
    fn test_geometry_validation() {
        let bad = MtdInfo {
            erase_block_size: 3000,
            ..TEST_INFO
        };
        assert!(Flash::new(SimMtd::new(MtdInfo {
            partition_size: 9000,
            ..bad
        }))
        .is_err());

        // Too few PEBs for two banks plus data
        assert!(Flash::new(SimMtd::new(MtdInfo {
            partition_size: 2 * 8192,
            ..TEST_INFO
        }))
        .is_err());

        // Write block size must divide the record alignment
        assert!(Flash::new(SimMtd::new(MtdInfo {
            write_block_size: 24,
            ..TEST_INFO
        }))
        .is_err());

        let flash = new_flash();
        assert_eq!(flash.peb_count(), 8);
        assert_eq!(flash.data_peb_count(), 6);
        assert_eq!(flash.leb_size(), 8192 - 48);
    }

    #[test]
    fn test_reserved_pebs_guarded() {
        let mut flash = new_flash();

        for pnum in [0, 1, 8] {
            assert!(flash.ec_read(pnum).is_err());
            assert!(flash.ec_write(pnum, &EcHdr::new(0)).is_err());
            assert!(flash.erase_peb(pnum).is_err());
        }
    }

    #[test]
    fn test_header_io() -> anyhow::Result<()> {
        let mut flash = new_flash();

        flash.erase_peb(2)?;
        flash.ec_write(2, &EcHdr::new(7))?;
        assert_eq!(flash.ec_read(2)?.ec, 7);

        assert!(flash.vid_read_raw(2)?.is_erased());
        assert!(matches!(flash.vid_read(2), Err(UbiError::BadHeader)));

        let vid = VidHdr::new(0, 3, 99, 100);
        flash.vid_write(2, &vid)?;
        assert_eq!(flash.vid_read(2)?, vid);

        Ok(())
    }

    #[test]
    fn test_data_alignment_policy() -> anyhow::Result<()> {
        let mut flash = new_flash();

        // One PEB per case: exact multiple, shorter than one block, head+tail
        for (pnum, len) in [(2u32, 32usize), (3, 7), (4, 100)] {
            flash.erase_peb(pnum)?;
            let buf: Vec<u8> = (0..len).map(|x| x as u8).collect();
            flash.data_write(pnum, &buf)?;

            let mut out = vec![0u8; len];
            flash.data_read(pnum, 0, &mut out)?;
            assert_eq!(out, buf);

            // The staging buffer zero-pads up to the next write block.
            let padded = len.next_multiple_of(TEST_INFO.write_block_size);
            let mut tail = vec![0u8; padded - len];
            flash.data_read(pnum, len, &mut tail)?;
            assert!(tail.iter().all(|&b| b == 0));
        }

        Ok(())
    }

    #[test]
    fn test_data_bounds() {
        let mut flash = new_flash();
        flash.erase_peb(2).unwrap();

        let too_big = vec![0u8; flash.leb_size() + 1];
        assert!(matches!(
            flash.data_write(2, &too_big),
            Err(UbiError::NoSpace)
        ));

        let mut buf = [0u8; 64];
        assert!(matches!(
            flash.data_read(2, flash.leb_size() - 32, &mut buf),
            Err(UbiError::NoSpace)
        ));
    }
}
