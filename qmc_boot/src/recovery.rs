// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pending-request processing: revert, commit and configuration backup

use crate::{
    auth::{image_signature_len, read_header},
    flash::Nor,
    se::{PolicySession, FW_VERSION, MAN_VERSION},
    Error,
};
use log::{debug as okay, info, trace};
use qmc_areas::{
    align_up, FirmwareHeader, FwState, MemoryMap, UpdateManifest, HEADER_BLOCK_SIZE, PAGE_SIZE,
    SECTOR_SIZE,
};

/// What the previous firmware run asked for
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FwRequest {
    Revert,
    Commit,
    BackupConfig,
    WatchdogExpiredOnly,
    VerifyOnly,
    NoPendingAction,
}

impl FwRequest {
    /// Classifies a durable state; the sticky watchdog bit may accompany any
    /// request.  Every other combination is unknown.
    pub fn classify(state: FwState) -> Result<Self, Error> {
        let bits = state.bits()?;
        let request = FwState {
            watchdog_expired: false,
            ..state
        };
        let plain = |f: FwState| f == request;
        let r = if plain(FwState {
            revert: true,
            verify_requested: true,
            ..Default::default()
        }) {
            FwRequest::Revert
        } else if plain(FwState {
            commit: true,
            verify_requested: true,
            ..Default::default()
        }) {
            FwRequest::Commit
        } else if plain(FwState {
            backup_config: true,
            ..Default::default()
        }) {
            FwRequest::BackupConfig
        } else if plain(FwState::verify()) {
            FwRequest::VerifyOnly
        } else if plain(FwState::none()) {
            if state.watchdog_expired {
                FwRequest::WatchdogExpiredOnly
            } else {
                FwRequest::NoPendingAction
            }
        } else {
            return Err(Error::UnknownState(bits));
        };
        Ok(r)
    }

    /// Whether the request moves an image between slots
    pub fn is_image_action(self) -> bool {
        matches!(
            self,
            FwRequest::Revert | FwRequest::Commit | FwRequest::BackupConfig | FwRequest::VerifyOnly
        )
    }
}

/// Length of the image in a slot: signed extent plus detached signature,
/// rounded up to a program page
fn image_len(flash: &mut Nor, hdr: &FirmwareHeader, slot_base: u32) -> Result<u32, Error> {
    let sign_offset = hdr
        .sign_data_addr
        .checked_sub(hdr.fw_data_addr)
        .ok_or(Error::ExtentViolation {
            what: "signature address",
            addr: hdr.sign_data_addr,
        })?;
    let sig_len = image_signature_len(flash, slot_base + sign_offset)?;
    sign_offset
        .checked_add(sig_len as u32)
        .and_then(|l| align_up(l, PAGE_SIZE))
        .ok_or(Error::ExtentViolation {
            what: "image length",
            addr: hdr.sign_data_addr,
        })
}

fn check_fits(len: u32, max: u32, what: &'static str) -> Result<(), Error> {
    if len > max {
        return Err(Error::TooLarge {
            what,
            len: u64::from(len),
            max: u64::from(max),
        });
    }
    Ok(())
}

/// Copies the recovery image over the main slot and restores the
/// configuration data from its backup
///
/// Returns the header of the restored image.
pub fn revert(flash: &mut Nor, map: &MemoryMap) -> Result<FirmwareHeader, Error> {
    let main = map.main_fw;
    let recovery = map.recovery;
    info!("reverting to the recovery image");

    // A staged package must not be reinstalled over the reverted image
    flash.erase(map.staging.start, SECTOR_SIZE)?;

    flash.erase(main.start, SECTOR_SIZE)?;
    flash.copy_programmed(recovery.start, main.start, PAGE_SIZE)?;
    let hdr = read_header(flash, main.start)?;
    let len = image_len(flash, &hdr, recovery.start)?;
    check_fits(len, recovery.len.min(main.len), "recovery image")?;
    trace!("recovery image: version {}, {len:#x} bytes", hdr.version);

    if len > SECTOR_SIZE {
        flash.erase(main.start + SECTOR_SIZE, len - SECTOR_SIZE)?;
    }
    flash.copy_programmed(recovery.start + PAGE_SIZE, main.start + PAGE_SIZE, len - PAGE_SIZE)?;
    flash.compare_ranges(recovery.start, main.start, len)?;

    restore_config(flash, map, &hdr)?;
    okay!("recovery image version {} restored", hdr.version);
    Ok(hdr)
}

fn cfg_extent(map: &MemoryMap, hdr: &FirmwareHeader) -> Result<qmc_areas::Extent, Error> {
    let cfg = hdr.cfg_extent();
    if !map.cfg_data.contains_extent(&cfg) {
        return Err(Error::ExtentViolation {
            what: "configuration data",
            addr: hdr.cfg_data_addr,
        });
    }
    check_fits(cfg.len, map.cfg_backup.len, "configuration data")?;
    Ok(cfg)
}

fn restore_config(flash: &mut Nor, map: &MemoryMap, hdr: &FirmwareHeader) -> Result<(), Error> {
    let cfg = cfg_extent(map, hdr)?;
    if cfg.is_empty() {
        return Ok(());
    }
    flash.copy(map.cfg_backup.start, cfg.start, cfg.len)?;
    flash.compare_ranges(map.cfg_backup.start, cfg.start, cfg.len)?;
    trace!("configuration data restored to {cfg}");
    Ok(())
}

/// Makes the running image the new recovery image and advances the trusted
/// firmware version
///
/// A manifest still staged is committed as well, then erased.  Returns the
/// committed firmware version.
pub fn commit(
    flash: &mut Nor,
    policy: &mut PolicySession,
    map: &MemoryMap,
) -> Result<u32, Error> {
    let main = map.main_fw;
    let recovery = map.recovery;
    info!("committing the running image");

    let hdr = read_header(flash, main.start)?;
    let len = image_len(flash, &hdr, main.start)?;
    check_fits(len, recovery.len.min(main.len), "main image")?;
    flash.copy(main.start, recovery.start, len)?;
    flash.compare_ranges(main.start, recovery.start, len)?;
    trace!("recovery slot now holds version {}", hdr.version);

    flash.erase_extent(map.cfg_backup)?;
    policy.write_u32_verified(FW_VERSION, hdr.version)?;

    let block = flash.read_vec(map.staging.start, HEADER_BLOCK_SIZE)?;
    if UpdateManifest::is_tagged(&block) {
        let m = UpdateManifest::parse(&block)?;
        let trusted = policy.read_u32(MAN_VERSION)?;
        if m.version > trusted {
            policy.write_u32_verified(MAN_VERSION, m.version)?;
            trace!("staged manifest version {} committed", m.version);
        }
        flash.erase(map.staging.start, SECTOR_SIZE)?;
    }
    okay!("firmware version {} committed", hdr.version);
    Ok(hdr.version)
}

/// Copies the configuration data of the running image to its backup
pub fn backup_config(flash: &mut Nor, map: &MemoryMap) -> Result<(), Error> {
    let hdr = read_header(flash, map.main_fw.start)?;
    let cfg = cfg_extent(map, &hdr)?;
    flash.erase_extent(map.cfg_backup)?;
    flash.copy_programmed(cfg.start, map.cfg_backup.start, cfg.len)?;
    flash.compare_ranges(cfg.start, map.cfg_backup.start, cfg.len)?;
    okay!("configuration data backed up ({:#x} bytes)", cfg.len);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(bits: u8) -> FwState {
        FwState::from_bits(bits).unwrap()
    }

    #[test]
    fn classification() {
        let cases = [
            (0x00, FwRequest::NoPendingAction),
            (0x08, FwRequest::WatchdogExpiredOnly),
            (0x11, FwRequest::Revert),
            (0x19, FwRequest::Revert),
            (0x12, FwRequest::Commit),
            (0x1A, FwRequest::Commit),
            (0x04, FwRequest::BackupConfig),
            (0x0C, FwRequest::BackupConfig),
            (0x10, FwRequest::VerifyOnly),
            (0x18, FwRequest::VerifyOnly),
        ];
        for (bits, want) in cases {
            assert_eq!(FwRequest::classify(state(bits)).unwrap(), want, "{bits:#04x}");
        }
    }

    #[test]
    fn unknown_combinations() {
        // Revert or commit without verify, both at once, stray bits
        for bits in [0x01, 0x02, 0x13, 0x03, 0x14, 0x20, 0x30, 0x40, 0x91] {
            assert!(
                matches!(
                    FwRequest::classify(state(bits)),
                    Err(Error::UnknownState(b)) if b == bits
                ),
                "{bits:#04x}"
            );
        }
    }

    #[test]
    fn image_actions_block_updates() {
        assert!(!FwRequest::NoPendingAction.is_image_action());
        assert!(!FwRequest::WatchdogExpiredOnly.is_image_action());
        assert!(FwRequest::VerifyOnly.is_image_action());
        assert!(FwRequest::Commit.is_image_action());
    }
}
