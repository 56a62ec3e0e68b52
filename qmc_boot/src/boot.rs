// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot orchestration
//!
//! [`Bootloader::run`] performs one complete boot: provisioning, key
//! reconstruction, the channel check, pending-request processing, the update
//! path, authentication with recovery fallback, the secondary-core bootstrap
//! and the hand-off.  Every step attaches the [`LogEvent`] it fails with, and
//! every failure ends in the single exit path.

use crate::{
    auth::{self, Entry},
    config::BootConfig,
    decommission,
    event::{encode_visual, EventRecorder, LedPattern, LogCipher, LogEvent, Panel},
    flash::{Flash, Nor},
    keys::{self, check_channel, KeyWrapUnit, SessionKeySet},
    persist::{GprBank, StateStore},
    recovery::{self, FwRequest},
    se::{SecureElement, Session, FW_VERSION, MAN_VERSION, RPC_KEY},
    secwd::{self, Soc, Timing},
    update::{self, RemovableMedia, Selection},
    Error,
};
use log::{debug as okay, info, trace, warn};
use qmc_areas::{BootState, FirmwareHeader, FwState};
use secwd_token::MAX_RNG_SEED_SIZE;
use serde::Serialize;
use zeroize::Zeroizing;

use LogEvent::*;

/// Every collaborator the boot path talks to
pub struct Board<'a> {
    pub flash: &'a mut dyn Flash,
    pub gpr: &'a mut dyn GprBank,
    pub se: &'a mut dyn SecureElement,
    pub puf: &'a mut dyn KeyWrapUnit,
    pub media: &'a mut dyn RemovableMedia,
    pub soc: &'a mut dyn Soc,
    pub panel: &'a mut dyn Panel,
    pub cipher: &'a mut dyn LogCipher,
}

/// A failed step and the event it is logged as
#[derive(thiserror::Error, Debug)]
#[error("{event}: {cause}")]
pub struct Failure {
    pub event: LogEvent,
    #[source]
    pub cause: Error,
}

impl Failure {
    pub fn new(event: LogEvent, cause: Error) -> Self {
        let event = match cause {
            Error::NotCommissioned | Error::Decommissioned => DeviceDecommissioned,
            _ => event,
        };
        Self { event, cause }
    }
}

trait OrLog<T> {
    fn or_log(self, event: LogEvent) -> Result<T, Failure>;
}

impl<T> OrLog<T> for Result<T, Error> {
    fn or_log(self, event: LogEvent) -> Result<T, Failure> {
        self.map_err(|cause| Failure::new(event, cause))
    }
}

/// How a boot ended
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// Control passes to the verified image
    Handoff { entry: Entry, backup_active: bool },
    /// A revert was requested; the device must reset
    Reset { event: LogEvent },
    /// The device stops, showing `pattern`
    Halted { event: LogEvent, pattern: LedPattern },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BootReport {
    pub outcome: Outcome,
    /// Every event recorded during the boot, in order
    pub events: Vec<LogEvent>,
}

/// Trusted versions held by the secure element
#[derive(Copy, Clone, Debug)]
struct Versions {
    fw: u32,
    man: u32,
}

pub struct Bootloader<'a> {
    cfg: &'a BootConfig,
    board: Board<'a>,
    recorder: EventRecorder,
    state: BootState,
    backup_active: bool,
}

impl<'a> Bootloader<'a> {
    pub fn new(cfg: &'a BootConfig, board: Board<'a>) -> Self {
        Self {
            cfg,
            board,
            recorder: EventRecorder::new(cfg.memory.event_log),
            state: BootState::default(),
            backup_active: false,
        }
    }

    pub fn run(mut self) -> BootReport {
        info!("=== boot ===");
        let outcome = match self.boot() {
            Ok(entry) => {
                okay!(
                    "handing off to {:#010x} (vector table {:#010x}{})",
                    entry.reset_vector,
                    entry.vector_table,
                    if self.backup_active {
                        ", recovery image"
                    } else {
                        ""
                    }
                );
                Outcome::Handoff {
                    entry,
                    backup_active: self.backup_active,
                }
            }
            Err(failure) => self.exit(failure),
        };
        self.persist_log();
        BootReport {
            outcome,
            events: self.recorder.into_history(),
        }
    }

    fn boot(&mut self) -> Result<Entry, Failure> {
        let cfg = self.cfg;
        let map = &cfg.memory;

        {
            let mut flash = Nor::new(&mut *self.board.flash, cfg.flash_attempts);
            if keys::key_store_blank(&mut flash, map.key_store).or_log(Scp03KeyRotationFailed)? {
                let mut state = StateStore::new(&mut *self.board.gpr);
                keys::provision(
                    &mut flash,
                    &mut *self.board.se,
                    &mut *self.board.puf,
                    &mut state,
                    cfg,
                )
                .or_log(Scp03KeyRotationFailed)?;
            }
        }

        self.state = StateStore::new(&mut *self.board.gpr)
            .read()
            .or_log(SvnsLpGprOpFailed)?;
        trace!("durable state: {:?}", self.state);

        let keys = {
            let mut flash = Nor::new(&mut *self.board.flash, cfg.flash_attempts);
            keys::reconstruct_keys(&mut flash, &mut *self.board.puf, map.key_store)
                .or_log(Scp03KeyReconFailed)?
        };

        match self.board.cipher.load_keys(&keys.log.key, &keys.log.nonce) {
            Ok(()) => {
                self.recorder.enable();
                trace!("encrypted event log enabled");
            }
            Err(e) => warn!("event log limited to the debug stream: {e}"),
        }

        check_channel(&mut *self.board.se, &keys, cfg.se_attempts).or_log(Scp03ConnFailed)?;

        let asked = decommission::requested(&mut *self.board.panel, &mut *self.board.media, cfg)
            .unwrap_or_else(|e| {
                warn!("decommission check failed: {e}");
                false
            });
        if asked {
            return Err(self.decommission(&keys));
        }

        let mut versions = {
            let mut s = Session::open(&mut *self.board.se, &keys.channel, cfg.se_attempts)
                .or_log(VerReadFromSeFailed)?;
            Versions {
                fw: s.read_u32(FW_VERSION).or_log(VerReadFromSeFailed)?,
                man: s.read_u32(MAN_VERSION).or_log(VerReadFromSeFailed)?,
            }
        };
        trace!(
            "trusted versions: firmware {}, manifest {}",
            versions.fw,
            versions.man
        );

        let request = self.process_request(&keys, &mut versions)?;
        if request.is_image_action() {
            trace!("{request:?} pending, skipping the update check");
        } else if let Err(f) = self.update(&keys, &mut versions) {
            warn!("update not applied: {}", f.cause);
            self.recorder.record(f.event);
        }
        self.persist_log();

        let (hdr, _) = self.authenticate_main(&keys, versions.fw)?;

        self.stage_bootstrap(&keys)?;
        keys::hand_off_log_keys(&mut *self.board.soc, &keys.log).or_log(HwInitDeinitFailed)?;
        if cfg.hand_off_channel_keys {
            keys::hand_off_channel_keys(&mut *self.board.soc, &keys.channel)
                .or_log(HwInitDeinitFailed)?;
        }
        drop(keys);
        trace!("session keys zeroized");
        self.persist_log();

        self.execute(&hdr)
    }

    fn persist_log(&mut self) {
        let mut flash = Nor::new(&mut *self.board.flash, self.cfg.flash_attempts);
        self.recorder.persist(&mut flash, &mut *self.board.cipher);
    }

    fn write_state(&mut self, fw_state: FwState) -> Result<(), Failure> {
        let next = self.state.with_fw_state(fw_state);
        StateStore::new(&mut *self.board.gpr)
            .write(&next)
            .or_log(SvnsLpGprOpFailed)?;
        self.state = next;
        Ok(())
    }

    /// Always ends the boot; success is reported as `DeviceDecommissioned`
    fn decommission(&mut self, keys: &SessionKeySet) -> Failure {
        let cfg = self.cfg;
        let mut flash = Nor::new(&mut *self.board.flash, cfg.flash_attempts);
        let done = Session::open(&mut *self.board.se, &keys.channel, cfg.se_attempts)
            .and_then(|mut s| decommission::decommission(&mut flash, &mut s, cfg));
        match done {
            Ok(()) => {
                // The log region is gone along with its keys
                self.recorder.disable();
                Failure::new(DeviceDecommissioned, Error::Decommissioned)
            }
            Err(cause) => Failure {
                event: DecommissioningFailed,
                cause,
            },
        }
    }

    fn process_request(
        &mut self,
        keys: &SessionKeySet,
        versions: &mut Versions,
    ) -> Result<FwRequest, Failure> {
        let cfg = self.cfg;
        let fw_state = self.state.fw_state;
        let request = FwRequest::classify(fw_state).or_log(UnknownFWReturnStatus)?;
        trace!("pending request: {request:?}");

        let mut flash = Nor::new(&mut *self.board.flash, cfg.flash_attempts);
        let done = match request {
            FwRequest::Revert => {
                recovery::revert(&mut flash, &cfg.memory).or_log(NewFWRevertFailed)?;
                self.backup_active = true;
                NewFWReverted
            }
            FwRequest::Commit => {
                let mut policy = check_channel(&mut *self.board.se, keys, cfg.se_attempts)
                    .or_log(NewFWCommitFailed)?;
                versions.fw = recovery::commit(&mut flash, &mut policy, &cfg.memory)
                    .or_log(NewFWCommitFailed)?;
                versions.man = policy.read_u32(MAN_VERSION).or_log(VerReadFromSeFailed)?;
                NewFWCommitted
            }
            FwRequest::BackupConfig => {
                recovery::backup_config(&mut flash, &cfg.memory).or_log(CfgDataBackUpFailed)?;
                CfgDataBackedUp
            }
            FwRequest::WatchdogExpiredOnly => {
                self.recorder.record(AwdtExpired);
                return Ok(request);
            }
            FwRequest::VerifyOnly | FwRequest::NoPendingAction => return Ok(request),
        };
        self.recorder.record(done);
        self.write_state(FwState::watchdog_only(fw_state.watchdog_expired))?;
        Ok(request)
    }

    /// Selects, authenticates and installs an update package
    fn update(&mut self, keys: &SessionKeySet, versions: &mut Versions) -> Result<(), Failure> {
        let cfg = self.cfg;
        let map = &cfg.memory;
        let mut flash = Nor::new(&mut *self.board.flash, cfg.flash_attempts);
        let media = &mut *self.board.media;

        let m = match update::select(&mut flash, media, cfg, versions.man).or_log(SdCardFailed)? {
            Selection::Nothing => {
                trace!("no update pending");
                return Ok(());
            }
            Selection::Stale { version, trusted } => {
                return Err(Failure::new(
                    InvalidFwuVersion,
                    Error::RollbackRejected { version, trusted },
                ))
            }
            Selection::Staged(m) => m,
            Selection::Media(_) => {
                update::media_to_staging(&mut flash, media, cfg).or_log(SdCardFailed)?
            }
        };

        {
            let mut session = Session::open(&mut *self.board.se, &keys.channel, cfg.se_attempts)
                .or_log(Scp03ConnFailed)?;
            let checked = auth::authenticate_manifest(
                &mut flash,
                &mut session,
                &m,
                versions.man,
                map.staging,
            );
            if let Err(cause) = checked {
                if let Err(e) = update::clear_staging(&mut flash, map.staging) {
                    warn!("could not clear staging: {e}");
                }
                return Err(Failure::new(FwuAuthFailed, cause));
            }
        }

        if let Err(cause) = update::install(&mut flash, &m, map.main_fw) {
            for extent in [map.main_fw, map.staging] {
                if let Err(e) = flash.erase_extent(extent) {
                    warn!("could not erase {extent}: {e}");
                }
            }
            return Err(Failure::new(ExtMemOprFailed, cause));
        }

        let sticky = self.state.fw_state.watchdog_expired;
        self.write_state(FwState {
            watchdog_expired: sticky,
            ..FwState::verify()
        })?;

        {
            let mut policy =
                check_channel(&mut *self.board.se, keys, cfg.se_attempts).or_log(FwuCommitFailed)?;
            policy
                .write_u32_verified(MAN_VERSION, m.version)
                .or_log(FwuCommitFailed)?;
        }
        versions.man = m.version;

        let mut flash = Nor::new(&mut *self.board.flash, cfg.flash_attempts);
        update::clear_staging(&mut flash, map.staging).or_log(ExtMemOprFailed)?;
        okay!("update version {} applied", m.version);
        Ok(())
    }

    fn authenticate_slot(
        &mut self,
        keys: &SessionKeySet,
        hdr: &FirmwareHeader,
        trusted: u32,
    ) -> Result<Entry, Error> {
        let cfg = self.cfg;
        let mut flash = Nor::new(&mut *self.board.flash, cfg.flash_attempts);
        let mut session = Session::open(&mut *self.board.se, &keys.channel, cfg.se_attempts)?;
        auth::authenticate(&mut flash, &mut session, hdr, trusted, cfg.memory.main_fw)
    }

    fn fall_back(&mut self) -> Result<FirmwareHeader, Failure> {
        let cfg = self.cfg;
        let mut flash = Nor::new(&mut *self.board.flash, cfg.flash_attempts);
        let hdr = recovery::revert(&mut flash, &cfg.memory).or_log(NewFWRevertFailed)?;
        self.backup_active = true;
        self.recorder.record(NewFWReverted);
        Ok(hdr)
    }

    /// Authenticates the main slot, reverting to the recovery image once
    fn authenticate_main(
        &mut self,
        keys: &SessionKeySet,
        trusted: u32,
    ) -> Result<(FirmwareHeader, Entry), Failure> {
        let main = self.cfg.memory.main_fw;
        let read = {
            let mut flash = Nor::new(&mut *self.board.flash, self.cfg.flash_attempts);
            auth::read_header(&mut flash, main.start)
        };
        let hdr = match read {
            Ok(hdr) => hdr,
            Err(cause) if self.backup_active => {
                return Err(Failure::new(BackUpImgAuthFailed, cause))
            }
            Err(e) => {
                warn!("main image header unreadable: {e}");
                self.fall_back()?
            }
        };

        match self.authenticate_slot(keys, &hdr, trusted) {
            Ok(entry) => return Ok((hdr, entry)),
            Err(cause) if self.backup_active => {
                return Err(Failure::new(BackUpImgAuthFailed, cause))
            }
            Err(e) => {
                warn!("main image rejected: {e}");
                self.recorder.record(MainFwAuthFailed);
            }
        }

        let hdr = self.fall_back()?;
        let entry = self
            .authenticate_slot(keys, &hdr, trusted)
            .or_log(BackUpImgAuthFailed)?;
        Ok((hdr, entry))
    }

    fn stage_bootstrap(&mut self, keys: &SessionKeySet) -> Result<(), Failure> {
        let cfg = self.cfg;
        let (seed, pk) = {
            let mut s = Session::open(&mut *self.board.se, &keys.channel, cfg.se_attempts)
                .or_log(RpcInitFailed)?;
            let seed = Zeroizing::new(s.random(MAX_RNG_SEED_SIZE).or_log(RpcInitFailed)?);
            let pk = s.read_object(RPC_KEY).or_log(RpcInitFailed)?;
            (seed, pk)
        };
        secwd::stage(&mut *self.board.soc, &seed, &pk).or_log(RpcInitFailed)?;
        secwd::init_mailbox(&mut *self.board.soc).or_log(RpcInitFailed)?;
        Ok(())
    }

    fn execute(&mut self, hdr: &FirmwareHeader) -> Result<Entry, Failure> {
        let cfg = self.cfg;
        let mut flash = Nor::new(&mut *self.board.flash, cfg.flash_attempts);
        let entry = auth::check_execution_extents(&mut flash, hdr, cfg.memory.main_fw)
            .or_log(FwExecutionFailed)?;
        secwd::load_image(&mut flash, &mut *self.board.soc, hdr).or_log(FwExecutionFailed)?;
        let polls = secwd::release(&mut *self.board.soc, hdr.cm4_boot_addr, Timing::from(cfg))
            .or_log(FwExecutionFailed)?;
        trace!("secure watchdog running after {polls} polls");
        Ok(entry)
    }

    fn exit(&mut self, failure: Failure) -> Outcome {
        let Failure { event, cause } = failure;
        log::error!("{event}: {cause}");
        if let Err(e) = secwd::scrub_shared(&mut *self.board.soc) {
            warn!("shared RAM not fully scrubbed: {e}");
        }

        let sticky = self.state.fw_state.watchdog_expired;
        match event {
            FwExecutionFailed if !self.backup_active => {
                let retry = FwState {
                    revert: true,
                    verify_requested: true,
                    watchdog_expired: sticky,
                    ..Default::default()
                };
                match self.write_state(retry) {
                    Ok(()) => {
                        self.recorder.record(event);
                        info!("revert requested, resetting");
                        return Outcome::Reset { event };
                    }
                    Err(f) => warn!("could not request a revert: {}", f.cause),
                }
            }
            NewFWRevertFailed => {
                if let Err(f) = self.write_state(FwState::watchdog_only(sticky)) {
                    warn!("could not clear the revert request: {}", f.cause);
                }
                warn!(
                    "no bootable image left; supply a new one as {}",
                    self.cfg.update_file
                );
            }
            _ => {}
        }

        self.recorder.record(event);
        let pattern = encode_visual(event);
        self.board.panel.show(pattern);
        info!("halted, indicator pattern {pattern}");
        Outcome::Halted { event, pattern }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_commissioning_is_reported_as_decommissioned() {
        let f: Result<(), Failure> = Err(Error::NotCommissioned).or_log(Scp03ConnFailed);
        assert_eq!(f.unwrap_err().event, DeviceDecommissioned);
        let f: Result<(), Failure> = Err(Error::Channel("x")).or_log(Scp03ConnFailed);
        assert_eq!(f.unwrap_err().event, Scp03ConnFailed);
    }
}
