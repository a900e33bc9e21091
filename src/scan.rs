//! Mount-time reconstruction of the in-RAM state from flash.
//!
//! A partition with no parseable metadata bank is freshly formatted; an
//! existing partition is scanned PEB by PEB and every block is classified
//! into exactly one pool or EBA slot. Two PEBs claiming the same LEB are
//! resolved by sequence number.

use crate::error::Result;
use crate::flash::Flash;
use crate::headers::{DevHdr, EcHdr, ParseHeader, VidHdr, UBI_RESERVED_PEBS, VolHdr};
use crate::mtd::{BufUtil, Mtd};
use crate::pools::PebPools;
use crate::volume::{Volume, VolumeConfig};
use crate::vtbl;

use log::{debug, warn};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Everything `device_init` needs to know after the flash has been read
#[derive(Debug)]
pub(crate) struct MountState {
    pub volumes: BTreeMap<u32, Volume>,
    pub pools: PebPools,
    pub global_seqnr: u64,
    pub vols_seqnr: u32,
    pub ec_avg: u32,
    pub revision: u32,
}

/// Format a blank (or unrecognizable) partition.
///
/// Every data-region PEB is erased and stamped with a fresh EC header, then
/// a zero-volume metadata table is committed. Ordering matters: if power is
/// cut before the commit, the next mount still sees no valid bank and
/// simply formats again.
pub(crate) fn fresh_format<M: Mtd>(flash: &mut Flash<M>) -> Result<MountState> {
    debug!("no valid metadata bank, formatting {} PEBs", flash.peb_count());

    let mut pools = PebPools::default();
    for pnum in UBI_RESERVED_PEBS..flash.peb_count() {
        flash.erase_peb(pnum)?;
        flash.ec_write(pnum, &EcHdr::new(0))?;
        pools.insert_free(0, pnum);
    }

    let dev_hdr = DevHdr::new(0, flash.partition_size() as u32, 0, 0);
    vtbl::commit(flash, &dev_hdr, &[])?;

    Ok(MountState {
        volumes: BTreeMap::new(),
        pools,
        global_seqnr: 0,
        vols_seqnr: 0,
        ec_avg: 0,
        revision: 0,
    })
}

/// Rebuild volumes, pools and the EBA tables from an existing partition
pub(crate) fn mount<M: Mtd>(
    flash: &mut Flash<M>,
    dev_hdr: DevHdr,
    table: Vec<VolHdr>,
) -> Result<MountState> {
    if dev_hdr.size as usize != flash.partition_size() {
        warn!(
            "device header records {} partition bytes, MTD reports {}",
            dev_hdr.size,
            flash.partition_size()
        );
    }

    let mut volumes = BTreeMap::new();
    let mut vols_seqnr = 0;
    for (vol_idx, vol_hdr) in table.iter().enumerate() {
        let config = VolumeConfig::try_from(vol_hdr)?;
        vols_seqnr = vols_seqnr.max(vol_hdr.vol_id + 1);
        volumes.insert(vol_hdr.vol_id, Volume::new(vol_idx as u32, config));
    }

    // First pass: erase counters. PEBs whose EC header does not parse are
    // quarantined with the partition-wide average as their stand-in counter.
    let data_pebs = UBI_RESERVED_PEBS..flash.peb_count();
    let mut ecs: Vec<Option<u32>> = Vec::with_capacity(flash.data_peb_count() as usize);
    let (mut ec_sum, mut ec_count) = (0u64, 0u64);
    for pnum in data_pebs.clone() {
        match flash.ec_read(pnum) {
            Ok(hdr) => {
                ec_sum += u64::from(hdr.ec);
                ec_count += 1;
                ecs.push(Some(hdr.ec));
            }
            Err(_) => ecs.push(None),
        }
    }
    let ec_avg = if ec_count > 0 {
        (ec_sum / ec_count) as u32
    } else {
        0
    };

    let ec_of = |pnum: u32| ecs[(pnum - UBI_RESERVED_PEBS) as usize];

    // Second pass: classify every data-region PEB.
    let mut pools = PebPools::default();
    let mut max_sqnum: Option<u64> = None;
    for pnum in data_pebs {
        let Some(ec) = ec_of(pnum) else {
            warn!("PEB {pnum}: unreadable EC header, quarantining");
            pools.quarantine(pnum, ec_avg);
            continue;
        };

        let vid_raw = match flash.vid_read_raw(pnum) {
            Ok(raw) => raw,
            Err(_) => {
                warn!("PEB {pnum}: unreadable VID region, quarantining");
                pools.quarantine(pnum, ec);
                continue;
            }
        };

        if vid_raw.is_erased() {
            pools.insert_free(ec, pnum);
            continue;
        }

        let Some(vid) = VidHdr::parse(&vid_raw) else {
            warn!("PEB {pnum}: corrupt VID header, quarantining");
            pools.quarantine(pnum, ec);
            continue;
        };

        max_sqnum = Some(max_sqnum.map_or(vid.sqnum, |sq| sq.max(vid.sqnum)));

        let Some(vol) = volumes.get_mut(&vid.vol_id) else {
            debug!("PEB {pnum}: orphan volume {} claim, marking dirty", vid.vol_id);
            pools.insert_dirty(ec, pnum);
            continue;
        };

        if vid.lnum >= vol.config.leb_count {
            debug!("PEB {pnum}: LEB {} past end of volume, marking dirty", vid.lnum);
            pools.insert_dirty(ec, pnum);
            continue;
        }

        match vol.eba.entry(vid.lnum) {
            Entry::Vacant(entry) => {
                entry.insert(pnum);
            }
            Entry::Occupied(mut entry) => {
                // Two PEBs claim the same LEB: an interrupted overwrite. The
                // higher sequence number carries the later copy; the loser is
                // recycled. Equal sequence numbers cannot come from correct
                // writes, so the first-discovered claim is kept.
                let rival = *entry.get();
                match flash.vid_read(rival) {
                    Err(_) => {
                        warn!("PEB {rival}: VID header lost on re-read, quarantining");
                        pools.quarantine(rival, ec_of(rival).unwrap_or(ec_avg));
                        entry.insert(pnum);
                    }
                    Ok(rival_vid) if vid.sqnum > rival_vid.sqnum => {
                        debug!(
                            "LEB {}:{}: PEB {pnum} (sqnum {}) supersedes PEB {rival}",
                            vid.vol_id, vid.lnum, vid.sqnum
                        );
                        pools.insert_dirty(ec_of(rival).unwrap_or(ec_avg), rival);
                        entry.insert(pnum);
                    }
                    Ok(_) => {
                        pools.insert_dirty(ec, pnum);
                    }
                }
            }
        }
    }

    Ok(MountState {
        volumes,
        pools,
        // Strictly above every sequence number persisted so far.
        global_seqnr: max_sqnum.map_or(0, |sq| sq + 1),
        vols_seqnr,
        ec_avg,
        revision: dev_hdr.revision,
    })
}
