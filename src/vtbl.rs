//! The dual-bank metadata store.
//!
//! The device header and the volume header table are replicated in the two
//! reserved PEBs. A commit rewrites bank 0 and then bank 1, so a power cut
//! leaves at least one bank parseable; the read side picks the validated
//! bank and repairs its peer before the device mounts.

use crate::error::{Result, UbiError};
use crate::flash::Flash;
use crate::headers::{
    ComputeCrc, DevHdr, ParseHeader, VolHdr, UBI_BANK_PEB_0, UBI_BANK_PEB_1, UBI_DEV_HDR_SIZE,
    UBI_VOL_HDR_SIZE,
};
use crate::mtd::Mtd;

use log::warn;

/// Outcome of probing the two device headers
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub(crate) enum DualBankState {
    /// Both banks parse and agree on `(revision, hdr_crc)`
    BanksValid,

    /// Only bank 0 is usable, or the banks disagree and bank 0 is newer
    Bank0Valid,

    /// Only bank 1 is usable, or the banks disagree and bank 1 is newer
    Bank1Valid,

    /// Neither bank parses; the partition is not mounted
    BanksInvalid,
}

fn read_dev_hdr<M: Mtd>(flash: &Flash<M>, bank: u32) -> Option<DevHdr> {
    let mut buf = [0u8; UBI_DEV_HDR_SIZE];
    flash.bank_read(bank, 0, &mut buf).ok()?;
    DevHdr::parse(&buf)
}

/// Probe both banks and classify the metadata state
pub(crate) fn dual_bank_state<M: Mtd>(flash: &Flash<M>) -> DualBankState {
    let hdr_0 = read_dev_hdr(flash, UBI_BANK_PEB_0);
    let hdr_1 = read_dev_hdr(flash, UBI_BANK_PEB_1);

    match (hdr_0, hdr_1) {
        (Some(a), Some(b)) if (a.revision, a.hdr_crc) == (b.revision, b.hdr_crc) => {
            DualBankState::BanksValid
        }
        // Diverged: the newer revision carries the later commit. A tie with
        // differing content is corruption; bank 0 wins.
        (Some(a), Some(b)) => {
            if b.revision > a.revision {
                DualBankState::Bank1Valid
            } else {
                DualBankState::Bank0Valid
            }
        }
        (Some(_), None) => DualBankState::Bank0Valid,
        (None, Some(_)) => DualBankState::Bank1Valid,
        (None, None) => DualBankState::BanksInvalid,
    }
}

/// Read and validate the volume header table behind a bank's device header
fn read_table<M: Mtd>(flash: &Flash<M>, bank: u32, dev_hdr: &DevHdr) -> Result<Vec<VolHdr>> {
    let mut table = Vec::with_capacity(dev_hdr.vol_count as usize);

    for vol_idx in 0..dev_hdr.vol_count {
        let offset = UBI_DEV_HDR_SIZE + vol_idx as usize * UBI_VOL_HDR_SIZE;
        let mut buf = [0u8; UBI_VOL_HDR_SIZE];
        flash.bank_read(bank, offset, &mut buf)?;

        table.push(VolHdr::parse(&buf).ok_or(UbiError::BadHeader)?);
    }

    Ok(table)
}

fn serialize<'a>(dev_hdr: &DevHdr, table: impl IntoIterator<Item = &'a VolHdr>) -> Vec<u8> {
    let mut buf = dev_hdr.encode();
    for vol_hdr in table {
        buf.extend_from_slice(&vol_hdr.encode());
    }
    buf
}

/// Load the metadata from the chosen bank.
///
/// Returns `None` when neither bank parses, i.e. the partition must be
/// freshly formatted. When exactly one bank is adoptable its image is
/// rewritten into the stale bank before returning, so a successful load
/// always leaves both banks in agreement.
pub(crate) fn load<M: Mtd>(flash: &mut Flash<M>) -> Result<Option<(DevHdr, Vec<VolHdr>)>> {
    let (chosen, repair) = match dual_bank_state(flash) {
        DualBankState::BanksValid => (UBI_BANK_PEB_0, None),
        DualBankState::Bank0Valid => (UBI_BANK_PEB_0, Some(UBI_BANK_PEB_1)),
        DualBankState::Bank1Valid => (UBI_BANK_PEB_1, Some(UBI_BANK_PEB_0)),
        DualBankState::BanksInvalid => return Ok(None),
    };

    let dev_hdr = read_dev_hdr(flash, chosen).ok_or(UbiError::BadHeader)?;
    let table = read_table(flash, chosen, &dev_hdr)?;

    if let Some(stale) = repair {
        warn!("metadata bank {stale} is stale or corrupt, rewriting from bank {chosen}");
        flash.bank_overwrite(stale, &serialize(&dev_hdr, &table))?;
    }

    Ok(Some((dev_hdr, table)))
}

/// Commit a new metadata image to both banks.
///
/// The sequence is erase bank 0, write bank 0, erase bank 1, write bank 1;
/// a crash part-way leaves bank 0 carrying the newer table (or nothing, in
/// which case the surviving bank 1 still holds the previous revision), and
/// the next [`load`] repairs the difference.
pub(crate) fn commit<M: Mtd>(
    flash: &mut Flash<M>,
    dev_hdr: &DevHdr,
    table: &[VolHdr],
) -> Result<()> {
    debug_assert_eq!(dev_hdr.vol_count as usize, table.len());

    let buf = serialize(dev_hdr, table);
    flash.bank_overwrite(UBI_BANK_PEB_0, &buf)?;
    flash.bank_overwrite(UBI_BANK_PEB_1, &buf)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mtd::{Mtd, MtdInfo, SimMtd};

    const TEST_INFO: MtdInfo = MtdInfo {
        partition_size: 4 * 8192,
        erase_block_size: 8192,
        write_block_size: 16,
    };

    fn vol_hdr(vol_id: u32) -> VolHdr {
        let mut name = [0u8; 16];
        name[0] = b'v';
        VolHdr::new(1, vol_id, 4, name)
    }

    #[test]
    fn test_commit_and_load() -> anyhow::Result<()> {
        let mut flash = Flash::new(SimMtd::new(TEST_INFO))?;

        assert_eq!(dual_bank_state(&flash), DualBankState::BanksInvalid);
        assert!(load(&mut flash)?.is_none());

        let dev_hdr = DevHdr::new(0, TEST_INFO.partition_size as u32, 3, 2);
        let table = vec![vol_hdr(0), vol_hdr(1)];
        commit(&mut flash, &dev_hdr, &table)?;

        assert_eq!(dual_bank_state(&flash), DualBankState::BanksValid);
        let (read_hdr, read_table) = load(&mut flash)?.unwrap();
        assert_eq!(read_hdr, dev_hdr);
        assert_eq!(read_table, table);

        Ok(())
    }

    #[test]
    fn test_single_bank_recovery() -> anyhow::Result<()> {
        for lost_bank in [UBI_BANK_PEB_0, UBI_BANK_PEB_1] {
            let mut flash = Flash::new(SimMtd::new(TEST_INFO))?;

            let dev_hdr = DevHdr::new(0, TEST_INFO.partition_size as u32, 1, 1);
            let table = vec![vol_hdr(0)];
            commit(&mut flash, &dev_hdr, &table)?;

            // Simulate a crash that left one bank erased.
            let mut mtd = flash.into_mtd();
            mtd.erase(lost_bank as usize * 8192, 8192)?;
            let mut flash = Flash::new(mtd)?;

            let expected = if lost_bank == UBI_BANK_PEB_0 {
                DualBankState::Bank1Valid
            } else {
                DualBankState::Bank0Valid
            };
            assert_eq!(dual_bank_state(&flash), expected);

            // Load adopts the survivor and repairs the lost bank.
            let (read_hdr, read_table) = load(&mut flash)?.unwrap();
            assert_eq!(read_hdr, dev_hdr);
            assert_eq!(read_table, table);
            assert_eq!(dual_bank_state(&flash), DualBankState::BanksValid);
        }

        Ok(())
    }

    #[test]
    fn test_diverged_banks_adopt_newer() -> anyhow::Result<()> {
        let mut flash = Flash::new(SimMtd::new(TEST_INFO))?;

        let old_hdr = DevHdr::new(0, TEST_INFO.partition_size as u32, 1, 0);
        commit(&mut flash, &old_hdr, &[])?;

        // A newer commit that only reached bank 0.
        let new_hdr = DevHdr::new(0, TEST_INFO.partition_size as u32, 2, 1);
        let new_table = vec![vol_hdr(0)];
        flash.bank_overwrite(UBI_BANK_PEB_0, &serialize(&new_hdr, &new_table))?;

        assert_eq!(dual_bank_state(&flash), DualBankState::Bank0Valid);
        let (read_hdr, read_table) = load(&mut flash)?.unwrap();
        assert_eq!(read_hdr, new_hdr);
        assert_eq!(read_table, new_table);
        assert_eq!(dual_bank_state(&flash), DualBankState::BanksValid);

        // And the mirrored case: bank 1 carries the newer revision.
        let newest_hdr = DevHdr::new(0, TEST_INFO.partition_size as u32, 3, 0);
        flash.bank_overwrite(UBI_BANK_PEB_1, &serialize(&newest_hdr, &[]))?;

        assert_eq!(dual_bank_state(&flash), DualBankState::Bank1Valid);
        let (read_hdr, read_table) = load(&mut flash)?.unwrap();
        assert_eq!(read_hdr, newest_hdr);
        assert!(read_table.is_empty());

        Ok(())
    }
}
