//! The UBI device: volumes and logical erase blocks over a raw flash
//! partition.
//!
//! Every public operation takes the device-wide mutex, so operations are
//! serialized; a call either completes, fails with no side effect, or fails
//! leaving a state the next mount reconstructs (see [`crate::scan`]).

use crate::error::{Result, UbiError};
use crate::flash::Flash;
use crate::headers::{
    DevHdr, EcHdr, VidHdr, VolHdr, UBI_DEV_HDR_SIZE, UBI_RESERVED_PEBS, UBI_VOL_HDR_SIZE,
};
use crate::mtd::Mtd;
use crate::pools::PebPools;
use crate::scan::{self, MountState};
use crate::volume::{VolType, Volume, VolumeConfig, UBI_MAX_VOLUMES};
use crate::vtbl;

use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Aggregated device statistics
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DeviceInfo {
    /// Number of LEBs the data region can hold
    pub leb_total: u32,

    /// Usable payload bytes per LEB
    pub leb_size: usize,

    pub free_pebs: usize,
    pub dirty_pebs: usize,
    pub bad_pebs: usize,

    /// Sum of every volume's LEB count
    pub allocated_lebs: u32,

    pub volume_count: usize,
}

struct Inner<M: Mtd> {
    flash: Flash<M>,
    volumes: BTreeMap<u32, Volume>,
    pools: PebPools,

    /// Strictly greater than every sequence number persisted so far
    global_seqnr: u64,

    /// Next volume ID to issue
    vols_seqnr: u32,

    /// Partition-wide average erase counter at mount time; the stand-in EC
    /// for PEBs whose own counter became unreadable
    ec_avg: u32,

    /// Revision of the last committed metadata table
    revision: u32,
}

/// A mounted UBI device
///
/// Created by [`UbiDevice::init`], which either mounts the existing
/// on-flash state or formats a blank partition.
pub struct UbiDevice<M: Mtd> {
    inner: Mutex<Inner<M>>,
}

impl<M: Mtd> UbiDevice<M> {
    /// Mount the partition, formatting it first if it holds no valid
    /// metadata
    pub fn init(mtd: M) -> Result<Self> {
        let mut flash = Flash::new(mtd)?;

        let state = match vtbl::load(&mut flash)? {
            Some((dev_hdr, table)) => scan::mount(&mut flash, dev_hdr, table)?,
            None => scan::fresh_format(&mut flash)?,
        };

        let MountState {
            volumes,
            pools,
            global_seqnr,
            vols_seqnr,
            ec_avg,
            revision,
        } = state;

        Ok(Self {
            inner: Mutex::new(Inner {
                flash,
                volumes,
                pools,
                global_seqnr,
                vols_seqnr,
                ec_avg,
                revision,
            }),
        })
    }

    /// Unmount the device, handing back the MTD
    ///
    /// All in-RAM state is discarded; a later [`UbiDevice::init`] rebuilds
    /// it from flash.
    pub fn deinit(self) -> M {
        self.inner
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .flash
            .into_mtd()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<M>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get aggregated pool and volume statistics
    pub fn info(&self) -> DeviceInfo {
        self.lock().info()
    }

    /// Reclaim at most one dirty PEB: erase it, restamp its EC header with
    /// an incremented counter and return it to the free pool
    pub fn erase_peb(&self) -> Result<()> {
        self.lock().erase_peb()
    }

    /// Read back every data-region PEB's erase counter, in PEB order
    ///
    /// Intended for diagnostics and wear tests; quarantined PEBs report
    /// their last-known counter.
    pub fn peb_erase_counters(&self) -> Result<Vec<u32>> {
        self.lock().peb_erase_counters()
    }

    /// Create a volume, or return the existing ID if one with the same name
    /// already exists
    pub fn volume_create(&self, cfg: &VolumeConfig) -> Result<u32> {
        self.lock().volume_create(cfg)
    }

    /// Change the LEB count of a dynamic volume
    pub fn volume_resize(&self, vol_id: u32, new_cfg: &VolumeConfig) -> Result<()> {
        self.lock().volume_resize(vol_id, new_cfg)
    }

    /// Remove a volume, retiring all of its mapped LEBs
    pub fn volume_remove(&self, vol_id: u32) -> Result<()> {
        self.lock().volume_remove(vol_id)
    }

    /// Get a volume's configuration and its number of mapped LEBs
    pub fn volume_get_info(&self, vol_id: u32) -> Result<(VolumeConfig, usize)> {
        self.lock().volume_get_info(vol_id)
    }

    /// Write a whole LEB
    ///
    /// The data lands on a freshly allocated PEB; the previous copy, if any,
    /// is retired to the dirty pool and stays intact on flash until
    /// reclaimed.
    pub fn leb_write(&self, vol_id: u32, lnum: u32, buf: &[u8]) -> Result<()> {
        self.lock().leb_write(vol_id, lnum, buf)
    }

    /// Read from a mapped LEB, starting `offset` bytes into its payload
    pub fn leb_read(&self, vol_id: u32, lnum: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.lock().leb_read(vol_id, lnum, offset, buf)
    }

    /// Map a LEB to a PEB without writing any payload
    pub fn leb_map(&self, vol_id: u32, lnum: u32) -> Result<()> {
        self.lock().leb_write(vol_id, lnum, &[])
    }

    /// Unmap a LEB; its PEB becomes reclaimable
    pub fn leb_unmap(&self, vol_id: u32, lnum: u32) -> Result<()> {
        self.lock().leb_unmap(vol_id, lnum)
    }

    pub fn leb_is_mapped(&self, vol_id: u32, lnum: u32) -> Result<bool> {
        self.lock().leb_is_mapped(vol_id, lnum)
    }

    /// Read back the payload size recorded in a mapped LEB's VID header
    pub fn leb_get_size(&self, vol_id: u32, lnum: u32) -> Result<usize> {
        self.lock().leb_get_size(vol_id, lnum)
    }
}

impl<M: Mtd> Inner<M> {
    fn allocated_lebs(&self) -> u32 {
        self.volumes.values().map(|v| v.config.leb_count).sum()
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            leb_total: self.flash.data_peb_count(),
            leb_size: self.flash.leb_size(),
            free_pebs: self.pools.free_count(),
            dirty_pebs: self.pools.dirty_count(),
            bad_pebs: self.pools.bad_count(),
            allocated_lebs: self.allocated_lebs(),
            volume_count: self.volumes.len(),
        }
    }

    /// Move a superseded PEB to the dirty pool, keyed by its on-flash erase
    /// counter
    fn retire(&mut self, pnum: u32) {
        match self.flash.ec_read(pnum) {
            Ok(hdr) => self.pools.insert_dirty(hdr.ec, pnum),
            Err(_) => {
                warn!("PEB {pnum}: EC header unreadable while retiring, quarantining");
                self.pools.quarantine(pnum, self.ec_avg);
            }
        }
    }

    /// Persist the volume table with a bumped revision
    fn commit_metadata(&mut self) -> Result<()> {
        let revision = self.revision + 1;
        let dev_hdr = DevHdr::new(
            0,
            self.flash.partition_size() as u32,
            revision,
            self.volumes.len() as u32,
        );

        let mut table: Vec<(u32, VolHdr)> = self
            .volumes
            .iter()
            .map(|(&vol_id, vol)| (vol.vol_idx, vol.config.to_hdr(vol_id)))
            .collect();
        table.sort_by_key(|&(vol_idx, _)| vol_idx);
        let table: Vec<VolHdr> = table.into_iter().map(|(_, hdr)| hdr).collect();

        vtbl::commit(&mut self.flash, &dev_hdr, &table)?;
        self.revision = revision;
        Ok(())
    }

    fn volume_create(&mut self, cfg: &VolumeConfig) -> Result<u32> {
        cfg.validate()?;

        if let Some((&vol_id, _)) = self
            .volumes
            .iter()
            .find(|(_, vol)| vol.config.name == cfg.name)
        {
            return Ok(vol_id);
        }

        let vol_count = self.volumes.len();
        if vol_count >= UBI_MAX_VOLUMES {
            return Err(UbiError::NoSpace);
        }
        if UBI_DEV_HDR_SIZE + (vol_count + 1) * UBI_VOL_HDR_SIZE > self.flash.eb_size() {
            return Err(UbiError::NoSpace);
        }

        // The partition must have enough unallocated LEBs left.
        if (self.pools.free_count() as u64)
            < u64::from(cfg.leb_count) + u64::from(self.allocated_lebs())
        {
            return Err(UbiError::NoSpace);
        }

        let vol_id = self.vols_seqnr;
        self.vols_seqnr += 1;
        self.volumes
            .insert(vol_id, Volume::new(vol_count as u32, cfg.clone()));

        self.commit_metadata()?;
        debug!("created volume {vol_id} ({})", cfg.name);
        Ok(vol_id)
    }

    fn volume_resize(&mut self, vol_id: u32, new_cfg: &VolumeConfig) -> Result<()> {
        new_cfg.validate()?;

        let (old_count, old_type) = {
            let vol = self.volumes.get(&vol_id).ok_or(UbiError::NotFound)?;
            (vol.config.leb_count, vol.config.vol_type)
        };

        if old_type != VolType::Dynamic || new_cfg.vol_type != VolType::Dynamic {
            return Err(UbiError::Canceled);
        }
        if new_cfg.leb_count == old_count {
            return Err(UbiError::Canceled);
        }

        if new_cfg.leb_count > old_count {
            let grow = u64::from(new_cfg.leb_count - old_count);
            let avail =
                u64::from(self.flash.data_peb_count()) - u64::from(self.allocated_lebs());
            if grow > avail {
                return Err(UbiError::NoSpace);
            }
        } else {
            // Shrinking retires every mapped LEB past the new end.
            let retired: Vec<u32> = {
                let vol = self.volumes.get_mut(&vol_id).ok_or(UbiError::NotFound)?;
                (new_cfg.leb_count..old_count)
                    .filter_map(|lnum| vol.eba.remove(&lnum))
                    .collect()
            };
            for pnum in retired {
                self.retire(pnum);
            }
        }

        if let Some(vol) = self.volumes.get_mut(&vol_id) {
            vol.config = new_cfg.clone();
        }
        self.commit_metadata()
    }

    fn volume_remove(&mut self, vol_id: u32) -> Result<()> {
        let vol = self.volumes.remove(&vol_id).ok_or(UbiError::NotFound)?;
        let vol_idx = vol.vol_idx;

        for (_, pnum) in vol.eba {
            self.retire(pnum);
        }

        // Close the hole in the persisted table.
        for vol in self.volumes.values_mut() {
            if vol.vol_idx > vol_idx {
                vol.vol_idx -= 1;
            }
        }
        self.commit_metadata()
    }

    fn volume_get_info(&self, vol_id: u32) -> Result<(VolumeConfig, usize)> {
        let vol = self.volumes.get(&vol_id).ok_or(UbiError::NotFound)?;
        Ok((vol.config.clone(), vol.eba.len()))
    }

    fn leb_write(&mut self, vol_id: u32, lnum: u32, buf: &[u8]) -> Result<()> {
        let (leb_count, old_pnum) = {
            let vol = self.volumes.get(&vol_id).ok_or(UbiError::NotFound)?;
            (vol.config.leb_count, vol.eba.get(&lnum).copied())
        };
        if lnum >= leb_count {
            return Err(UbiError::OutOfRange);
        }
        if buf.len() > self.flash.leb_size() {
            return Err(UbiError::NoSpace);
        }
        if self.pools.free_count() == 0 {
            return Err(UbiError::NoSpace);
        }

        // Retire the old copy first, in RAM only. Its data stays intact on
        // flash until the PEB is reclaimed, so if this write is interrupted
        // anywhere below, the next mount still finds a valid copy and the
        // sequence numbers pick the later one.
        if let Some(old_pnum) = old_pnum {
            if let Some(vol) = self.volumes.get_mut(&vol_id) {
                vol.eba.remove(&lnum);
            }
            self.retire(old_pnum);
        }

        let (ec, pnum) = self.pools.pop_min_free().ok_or(UbiError::NoSpace)?;

        let sqnum = self.global_seqnr;
        self.global_seqnr += 1;

        let vid_hdr = VidHdr::new(vol_id, lnum, sqnum, buf.len() as u32);
        if let Err(err) = self.flash.vid_write(pnum, &vid_hdr) {
            warn!("PEB {pnum}: VID header write failed, quarantining");
            self.pools.quarantine(pnum, ec);
            return Err(err);
        }

        if !buf.is_empty() {
            if let Err(err) = self.flash.data_write(pnum, buf) {
                warn!("PEB {pnum}: payload write failed, quarantining");
                self.pools.quarantine(pnum, ec);
                return Err(err);
            }
        }

        if let Some(vol) = self.volumes.get_mut(&vol_id) {
            vol.eba.insert(lnum, pnum);
        }
        Ok(())
    }

    fn leb_read(&self, vol_id: u32, lnum: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        let vol = self.volumes.get(&vol_id).ok_or(UbiError::NotFound)?;
        if lnum >= vol.config.leb_count {
            return Err(UbiError::OutOfRange);
        }
        let pnum = *vol.eba.get(&lnum).ok_or(UbiError::NotFound)?;

        self.flash.data_read(pnum, offset, buf)
    }

    fn leb_unmap(&mut self, vol_id: u32, lnum: u32) -> Result<()> {
        let vol = self.volumes.get_mut(&vol_id).ok_or(UbiError::NotFound)?;
        if lnum >= vol.config.leb_count {
            return Err(UbiError::OutOfRange);
        }
        let pnum = vol.eba.remove(&lnum).ok_or(UbiError::NotFound)?;

        self.retire(pnum);
        Ok(())
    }

    fn leb_is_mapped(&self, vol_id: u32, lnum: u32) -> Result<bool> {
        let vol = self.volumes.get(&vol_id).ok_or(UbiError::NotFound)?;
        if lnum >= vol.config.leb_count {
            return Err(UbiError::OutOfRange);
        }
        Ok(vol.eba.contains_key(&lnum))
    }

    fn leb_get_size(&self, vol_id: u32, lnum: u32) -> Result<usize> {
        let vol = self.volumes.get(&vol_id).ok_or(UbiError::NotFound)?;
        if lnum >= vol.config.leb_count {
            return Err(UbiError::OutOfRange);
        }
        let pnum = *vol.eba.get(&lnum).ok_or(UbiError::NotFound)?;

        let vid_hdr = self.flash.vid_read(pnum)?;
        Ok(vid_hdr.data_size as usize)
    }

    fn erase_peb(&mut self) -> Result<()> {
        let Some((key_ec, pnum)) = self.pools.pop_min_dirty() else {
            return Ok(());
        };

        let ec = match self.flash.ec_read(pnum) {
            Ok(hdr) => hdr.ec,
            Err(err) => {
                warn!("PEB {pnum}: EC header unreadable before erase, quarantining");
                self.pools.quarantine(pnum, key_ec);
                return Err(err);
            }
        };

        if let Err(err) = self.flash.erase_peb(pnum) {
            warn!("PEB {pnum}: erase failed, quarantining");
            self.pools.quarantine(pnum, ec);
            return Err(err);
        }

        let new_ec = ec + 1;
        if let Err(err) = self.flash.ec_write(pnum, &EcHdr::new(new_ec)) {
            warn!("PEB {pnum}: EC header rewrite failed, quarantining");
            self.pools.quarantine(pnum, ec);
            return Err(err);
        }

        self.pools.insert_free(new_ec, pnum);
        Ok(())
    }

    fn peb_erase_counters(&self) -> Result<Vec<u32>> {
        let mut counters = Vec::with_capacity(self.flash.data_peb_count() as usize);
        for pnum in UBI_RESERVED_PEBS..self.flash.peb_count() {
            match self.flash.ec_read(pnum) {
                Ok(hdr) => counters.push(hdr.ec),
                Err(err) => match self.pools.bad_ec(pnum) {
                    Some(ec) => counters.push(ec),
                    None => return Err(err),
                },
            }
        }
        Ok(counters)
    }
}
