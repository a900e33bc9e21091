//! MTD partition access over the Linux MTD character device interface

use super::{Mtd, MtdInfo};

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// Flash partition that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdPartition {
    file: File,
    info: MtdInfo,
}

impl MtdPartition {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let info = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())
                .map_err(io::Error::from)?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, info })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> io::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                let mtd_dev = line.split(':').next().unwrap_or_default();
                return Self::open(Path::new("/dev").join(mtd_dev));
            }
        }

        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("MTD device {name} could not be found"),
        ))
    }
}

impl Mtd for MtdPartition {
    fn info(&self) -> MtdInfo {
        self.info
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset as u64)
    }

    fn write(&mut self, offset: usize, buf: &[u8]) -> io::Result<()> {
        self.file.write_all_at(buf, offset as u64)
    }

    fn erase(&mut self, offset: usize, len: usize) -> io::Result<()> {
        let erase_info = ioctl::erase_info_user {
            start: offset as u32,
            length: len as u32,
        };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info).map_err(io::Error::from)?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::MtdInfo;

    use nix::{ioctl_read, ioctl_write_ptr};
    use std::io;

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<MtdInfo> for mtd_info_user {
        type Error = io::Error;

        fn try_into(self) -> io::Result<MtdInfo> {
            if self.size % self.erasesize != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "MTD size not multiple of erasesize",
                ));
            }

            Ok(MtdInfo {
                partition_size: self.size as usize,
                erase_block_size: self.erasesize as usize,
                write_block_size: self.writesize as usize,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);
}
