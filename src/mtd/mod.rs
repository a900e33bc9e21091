//! Abstractions and code to access raw flash partitions

use std::io;

#[cfg(target_os = "linux")]
pub mod linux;

/// Convenience methods for operating on `[u8]`s read back from flash
pub trait BufUtil {
    /// Does this buffer contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl BufUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the geometry of a flash partition
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MtdInfo {
    /// Total partition size in bytes
    pub partition_size: usize,

    /// Erase block size in bytes, identical for every block
    pub erase_block_size: usize,

    /// Write granule in bytes; writes must be aligned multiples of this
    pub write_block_size: usize,
}

/// Represents a memory technology device (MTD) partition
///
/// All offsets are relative to the start of the partition. Implementations
/// report transport failures as [`io::Error`]; the UBI core does not retry.
pub trait Mtd {
    /// Get the partition geometry
    fn info(&self) -> MtdInfo;

    /// Read `buf.len()` bytes starting at `offset`
    fn read(&self, offset: usize, buf: &mut [u8]) -> io::Result<()>;

    /// Write `buf` starting at `offset`
    ///
    /// `offset` and `buf.len()` must be multiples of the write block size,
    /// and the target range must have been erased since it was last written.
    fn write(&mut self, offset: usize, buf: &[u8]) -> io::Result<()>;

    /// Erase `len` bytes starting at `offset`; both must be multiples of the
    /// erase block size
    fn erase(&mut self, offset: usize, len: usize) -> io::Result<()>;
}

fn einval(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
}

/// A simulated in-memory flash partition, for testing purposes
///
/// Erase fills the range with `0xFF`; writes enforce the alignment and
/// write-once-between-erases rules real NOR/NAND parts impose, so code that
/// would corrupt a physical device fails loudly here instead.
#[derive(Debug, Clone)]
pub struct SimMtd {
    data: Vec<u8>,
    info: MtdInfo,
}

impl SimMtd {
    /// Create a fully-erased simulated partition with the given geometry
    pub fn new(info: MtdInfo) -> Self {
        assert!(info.erase_block_size > 0 && info.write_block_size > 0);
        assert_eq!(info.partition_size % info.erase_block_size, 0);

        Self {
            data: vec![0xFF; info.partition_size],
            info,
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.data.len()) {
            return Err(einval("range out of bounds"));
        }
        Ok(())
    }
}

impl Mtd for SimMtd {
    fn info(&self) -> MtdInfo {
        self.info
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        self.check_range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, buf: &[u8]) -> io::Result<()> {
        let wb = self.info.write_block_size;
        self.check_range(offset, buf.len())?;
        if offset % wb != 0 || buf.len() % wb != 0 {
            return Err(einval("write not aligned to write block size"));
        }

        let target = &mut self.data[offset..offset + buf.len()];
        if !target.is_erased() {
            return Err(einval("write to non-erased area"));
        }
        target.copy_from_slice(buf);
        Ok(())
    }

    fn erase(&mut self, offset: usize, len: usize) -> io::Result<()> {
        let eb = self.info.erase_block_size;
        self.check_range(offset, len)?;
        if offset % eb != 0 || len % eb != 0 {
            return Err(einval("erase not aligned to erase block size"));
        }

        self.data[offset..offset + len].fill(0xFF);
        Ok(())
    }
}

#[cfg(test)]
const TEST_INFO: MtdInfo = MtdInfo {
    partition_size: 8 * 1024,
    erase_block_size: 1024,
    write_block_size: 16,
};

#[test]
fn test_sim_read_write() {
    let mut mtd = SimMtd::new(TEST_INFO);

    let data_in = vec![0xA5u8; 64];
    let mut data_out = vec![0u8; 64];

    mtd.write(1024, &data_in).unwrap();
    mtd.read(1024, &mut data_out).unwrap();
    assert_eq!(data_out, data_in);

    mtd.read(1024 + 64, &mut data_out).unwrap();
    assert!(data_out.is_erased());

    // Rewriting an already-programmed area must fail until it is erased.
    assert!(mtd.write(1024, &data_in).is_err());
    mtd.erase(1024, 1024).unwrap();
    mtd.write(1024, &data_in).unwrap();
}

#[test]
fn test_sim_alignment() {
    let mut mtd = SimMtd::new(TEST_INFO);

    assert!(mtd.write(8, &[0u8; 16]).is_err());
    assert!(mtd.write(0, &[0u8; 9]).is_err());
    assert!(mtd.erase(16, 1024).is_err());
    assert!(mtd.erase(0, 100).is_err());
    assert!(mtd.write(TEST_INFO.partition_size - 8, &[0u8; 16]).is_err());
}

#[test]
fn test_sim_erase() {
    let mut mtd = SimMtd::new(TEST_INFO);

    mtd.write(0, &[0u8; 16]).unwrap();
    mtd.erase(0, 1024).unwrap();

    let mut buf = vec![0u8; 1024];
    mtd.read(0, &mut buf).unwrap();
    assert!(buf.is_erased());
}
