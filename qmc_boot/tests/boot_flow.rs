// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use qmc_areas::{state::STATE_GPR, Extent, FirmwareHeader};
use qmc_boot::{
    auth,
    event::LedPattern,
    flash::{Flash, Nor},
    keys,
    se::{Session, AES_AUTH_OBJ, AES_POLICY_KEY, FW_VERSION, MAN_VERSION},
    sign::{build_package, load_private_key, load_public_key, seal, sign_image, ImageSpec},
    sim::{MemMedia, Peer, SimBoard, SimPanel},
    update::RemovableMedia,
    BootConfig, BootReport, Bootloader, Error, LogEvent, Outcome,
};
use rsa::RsaPrivateKey;
use secwd_token::{CHANNEL_KEYS_ADDR, CORE1_RAM_BASE, INIT_DATA_ADDR};

const FW_KEY: &str = include_str!("data/fw_key.pem");
const FW_PUB: &str = include_str!("data/fw_pub.pem");
const FWU_KEY: &str = include_str!("data/fwu_key.pem");
const FWU_PUB: &str = include_str!("data/fwu_pub.pem");

struct Device {
    cfg: BootConfig,
    sim: SimBoard,
    fw_key: RsaPrivateKey,
    fwu_key: RsaPrivateKey,
}

impl Device {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let cfg = BootConfig::default();
        let mut sim = SimBoard::new(&cfg.memory, 7);
        sim.commission(
            load_public_key(FW_PUB).unwrap(),
            load_public_key(FWU_PUB).unwrap(),
        );
        Self {
            cfg,
            sim,
            fw_key: load_private_key(FW_KEY).unwrap(),
            fwu_key: load_private_key(FWU_KEY).unwrap(),
        }
    }

    /// A device that has completed its first boot with `main` and
    /// `recovery` images, trusting the recovery version
    fn provisioned(main: u32, recovery: u32) -> Self {
        let mut dev = Self::new();
        let main_image = dev.image(main);
        let recovery_image = dev.image(recovery);
        dev.put(dev.cfg.memory.main_fw.start, &main_image);
        dev.put(dev.cfg.memory.recovery.start, &recovery_image);
        dev.sim.se.set_version(FW_VERSION, recovery);
        let report = dev.boot();
        assert!(matches!(report.outcome, Outcome::Handoff { .. }), "{report:?}");
        dev
    }

    fn spec(&self, version: u32) -> ImageSpec {
        ImageSpec {
            cfg: Extent::new(self.cfg.memory.cfg_data.start, 0x100),
            ..ImageSpec::new(version, self.cfg.memory.main_fw.start)
        }
    }

    fn image(&self, version: u32) -> Vec<u8> {
        sign_image(&self.spec(version), &self.fw_key).unwrap()
    }

    fn package(&self, fw_version: u32, version: u32) -> Vec<u8> {
        build_package(
            &self.image(fw_version),
            version,
            self.cfg.memory.staging,
            &self.fwu_key,
        )
        .unwrap()
    }

    fn put(&mut self, addr: u32, data: &[u8]) {
        self.sim.flash.load(addr, data).unwrap();
    }

    fn read(&mut self, addr: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.sim.flash.read(addr, &mut buf).unwrap();
        buf
    }

    fn main_header(&mut self) -> FirmwareHeader {
        let block = self.read(self.cfg.memory.main_fw.start, 256);
        FirmwareHeader::parse(&block).unwrap()
    }

    fn insert_media(&mut self, files: &[(&str, Vec<u8>)]) {
        let mut media = MemMedia::inserted();
        for (path, data) in files {
            media.put(path, data.clone());
        }
        self.sim.media = Box::new(media);
    }

    fn fw_state(&self) -> u8 {
        (self.sim.gpr.regs[STATE_GPR] >> 24) as u8
    }

    fn set_fw_state(&mut self, bits: u8) {
        self.sim.gpr.regs[STATE_GPR] = u32::from(bits) << 24;
    }

    fn boot(&mut self) -> BootReport {
        let report = Bootloader::new(&self.cfg, self.sim.board()).run();
        self.sim.power_cycle();
        report
    }
}

fn halted(report: &BootReport) -> (LogEvent, LedPattern) {
    match report.outcome {
        Outcome::Halted { event, pattern } => (event, pattern),
        other => panic!("expected a halt, got {other:?}"),
    }
}

fn handed_off(report: &BootReport) -> bool {
    match report.outcome {
        Outcome::Handoff { backup_active, .. } => backup_active,
        other => panic!("expected a hand-off, got {other:?}"),
    }
}

#[test]
fn first_boot_provisions_and_hands_off() {
    let mut dev = Device::new();
    let image = dev.image(1);
    dev.put(dev.cfg.memory.main_fw.start, &image);
    dev.put(dev.cfg.memory.recovery.start, &image);
    dev.sim.se.set_version(FW_VERSION, 1);

    let report = dev.boot();
    let Outcome::Handoff {
        entry,
        backup_active,
    } = report.outcome
    else {
        panic!("{report:?}");
    };
    assert!(!backup_active);
    assert_eq!(entry.vector_table, 0x6008_0100);
    assert_eq!(entry.reset_vector, 0x6008_0109);
    assert_eq!(entry.stack_pointer, 0x2000_8000);
    assert!(report.events.is_empty());

    assert!(dev.sim.se.mandated());
    assert!(!dev.sim.se.has_object(AES_POLICY_KEY));
    assert_eq!(dev.sim.soc.released_at, None, "power cycle resets the core");
    assert_eq!(dev.sim.soc.peek(CORE1_RAM_BASE, 0x40).unwrap(), vec![0xA5; 0x40]);
    assert_eq!(dev.sim.soc.peek(INIT_DATA_ADDR, 48).unwrap(), vec![0; 48]);
    let handed = dev.sim.soc.peek(CHANNEL_KEYS_ADDR, 48).unwrap();
    assert_eq!(handed, dev.sim.se.channel_keys().to_bytes().to_vec());

    // The key store is written once
    let store = dev.read(dev.cfg.memory.key_store.start, 64);
    assert!(matches!(dev.boot().outcome, Outcome::Handoff { .. }));
    assert_eq!(dev.read(dev.cfg.memory.key_store.start, 64), store);
}

#[test]
fn uncommissioned_device_halts() {
    let mut dev = Device::new();
    dev.sim.se = qmc_boot::sim::SimSecureElement::new(1);
    let (event, pattern) = halted(&dev.boot());
    assert_eq!(event, LogEvent::DeviceDecommissioned);
    assert_eq!(pattern, LedPattern(0b1111));
}

#[test]
fn commit_advances_trust_once() {
    let mut dev = Device::provisioned(2, 1);
    dev.set_fw_state(0x12);
    let report = dev.boot();
    assert!(!handed_off(&report));
    assert_eq!(report.events, vec![LogEvent::NewFWCommitted]);
    assert_eq!(dev.sim.se.version(FW_VERSION), Some(2));
    assert_eq!(dev.fw_state(), 0x00);

    let main = dev.read(dev.cfg.memory.main_fw.start, 0x400);
    let recovery = dev.read(dev.cfg.memory.recovery.start, 0x400);
    assert_eq!(main, recovery);

    // Nothing left to process
    let report = dev.boot();
    assert!(report.events.is_empty());
}

#[test]
fn watchdog_bit_is_sticky() {
    let mut dev = Device::provisioned(2, 1);
    dev.set_fw_state(0x1A);
    let report = dev.boot();
    assert_eq!(report.events, vec![LogEvent::NewFWCommitted]);
    assert_eq!(dev.fw_state(), 0x08);

    let report = dev.boot();
    assert_eq!(report.events, vec![LogEvent::AwdtExpired]);
    assert_eq!(dev.fw_state(), 0x08);
}

#[test]
fn revert_restores_recovery_and_config() {
    let mut dev = Device::provisioned(2, 1);
    let map = dev.cfg.memory.clone();
    dev.put(map.cfg_backup.start, &[0x42; 0x100]);
    dev.put(map.cfg_data.start, &[0x99; 0x100]);
    dev.set_fw_state(0x19);

    let report = dev.boot();
    assert!(handed_off(&report));
    assert_eq!(report.events, vec![LogEvent::NewFWReverted]);
    assert_eq!(dev.fw_state(), 0x08);
    assert_eq!(dev.main_header().version, 1);
    assert_eq!(dev.read(map.cfg_data.start, 0x100), vec![0x42; 0x100]);
}

#[test]
fn corrupted_main_falls_back_to_recovery() {
    let mut dev = Device::provisioned(2, 1);
    let at = dev.cfg.memory.main_fw.start + 0x150;
    dev.put(at, &[0x00]);

    let report = dev.boot();
    assert!(handed_off(&report));
    assert_eq!(
        report.events,
        vec![LogEvent::MainFwAuthFailed, LogEvent::NewFWReverted]
    );
    assert_eq!(dev.main_header().version, 1);
}

#[test]
fn rolled_back_main_falls_back_to_recovery() {
    let mut dev = Device::provisioned(3, 3);
    let old = dev.image(2);
    dev.put(dev.cfg.memory.main_fw.start, &old);

    let report = dev.boot();
    assert!(handed_off(&report));
    assert_eq!(dev.main_header().version, 3);
}

#[test]
fn unreadable_main_header_reverts() {
    let mut dev = Device::provisioned(1, 1);
    let main = dev.cfg.memory.main_fw;
    dev.sim.flash.erase(main.start, 0x1000).unwrap();

    let report = dev.boot();
    assert!(handed_off(&report));
    assert_eq!(report.events, vec![LogEvent::NewFWReverted]);
}

#[test]
fn bad_recovery_halts() {
    let mut dev = Device::provisioned(1, 1);
    let map = dev.cfg.memory.clone();
    dev.put(map.main_fw.start + 0x150, &[0x00]);
    dev.put(map.recovery.start + 0x150, &[0x00]);

    let report = dev.boot();
    let (event, pattern) = halted(&report);
    assert_eq!(event, LogEvent::BackUpImgAuthFailed);
    assert_eq!(pattern, LedPattern(0b1101));
    assert_eq!(dev.sim.panel.shown.last(), Some(&pattern));
    assert_eq!(
        report.events,
        vec![
            LogEvent::MainFwAuthFailed,
            LogEvent::NewFWReverted,
            LogEvent::BackUpImgAuthFailed
        ]
    );
}

#[test]
fn failed_revert_asks_for_new_media() {
    let mut dev = Device::provisioned(2, 1);
    let recovery = dev.cfg.memory.recovery;
    dev.sim.flash.erase(recovery.start, 0x1000).unwrap();
    dev.set_fw_state(0x11);

    let (event, pattern) = halted(&dev.boot());
    assert_eq!(event, LogEvent::NewFWRevertFailed);
    assert_eq!(pattern, LedPattern(0b1010));
    assert_eq!(dev.fw_state(), 0x00);
}

#[test]
fn silent_secondary_core_requests_one_revert() {
    let mut dev = Device::provisioned(2, 1);
    dev.sim.soc.peer = Peer::Never;

    let report = dev.boot();
    assert_eq!(
        report.outcome,
        Outcome::Reset {
            event: LogEvent::FwExecutionFailed
        }
    );
    assert_eq!(dev.fw_state(), 0x11);
    assert_eq!(dev.sim.soc.peek(CHANNEL_KEYS_ADDR, 48).unwrap(), vec![0; 48]);

    // The recovery image runs next; a second timeout halts
    let report = dev.boot();
    let (event, pattern) = halted(&report);
    assert_eq!(event, LogEvent::FwExecutionFailed);
    assert_eq!(pattern, LedPattern(0b1001));
    assert_eq!(
        report.events,
        vec![LogEvent::NewFWReverted, LogEvent::FwExecutionFailed]
    );
}

#[test]
fn update_from_media() {
    let mut dev = Device::provisioned(1, 1);
    let path = dev.cfg.update_file.clone();
    let pkg = dev.package(2, 2);
    dev.insert_media(&[(&path, pkg)]);
    dev.set_fw_state(0x08);

    let report = dev.boot();
    assert!(!handed_off(&report));
    assert_eq!(dev.main_header().version, 2);
    assert_eq!(dev.fw_state(), 0x18);
    assert_eq!(dev.sim.se.version(MAN_VERSION), Some(2));
    assert!(!dev.sim.media.exists(&path).unwrap());
    let staging = dev.cfg.memory.staging.start;
    assert_eq!(dev.read(staging, 4), vec![0xFF; 4]);

    // The application confirms the new image
    dev.set_fw_state(0x12);
    let report = dev.boot();
    assert_eq!(report.events, vec![LogEvent::NewFWCommitted]);
    assert_eq!(dev.sim.se.version(FW_VERSION), Some(2));
}

#[test]
fn stale_package_is_discarded() {
    let mut dev = Device::provisioned(1, 1);
    dev.sim.se.set_version(MAN_VERSION, 3);
    let path = dev.cfg.update_file.clone();
    let pkg = dev.package(2, 3);
    dev.insert_media(&[(&path, pkg)]);

    let report = dev.boot();
    assert!(!handed_off(&report));
    assert_eq!(report.events, vec![LogEvent::InvalidFwuVersion]);
    assert_eq!(dev.main_header().version, 1);
    assert!(!dev.sim.media.exists(&path).unwrap());
}

#[test]
fn tampered_package_is_rejected() {
    let mut dev = Device::provisioned(1, 1);
    let path = dev.cfg.update_file.clone();
    let mut pkg = dev.package(2, 2);
    pkg[0x180] ^= 0x01;
    dev.insert_media(&[(&path, pkg)]);

    let report = dev.boot();
    assert!(!handed_off(&report));
    assert_eq!(report.events, vec![LogEvent::FwuAuthFailed]);
    assert_eq!(dev.main_header().version, 1);
    assert_eq!(dev.sim.se.version(MAN_VERSION), Some(0));
    let staging = dev.cfg.memory.staging.start;
    assert_eq!(dev.read(staging, 4), vec![0xFF; 4]);
}

#[test]
fn pending_request_blocks_updates() {
    let mut dev = Device::provisioned(1, 1);
    let path = dev.cfg.update_file.clone();
    let pkg = dev.package(2, 2);
    dev.insert_media(&[(&path, pkg)]);
    dev.set_fw_state(0x10);

    dev.boot();
    assert_eq!(dev.main_header().version, 1);
    assert!(dev.sim.media.exists(&path).unwrap());
}

#[test]
fn decommissioning_wipes_the_device() {
    let mut dev = Device::provisioned(1, 1);
    let path = dev.cfg.decommission_file.clone();
    dev.insert_media(&[(&path, vec![])]);
    dev.sim.panel = SimPanel::held();

    let (event, pattern) = halted(&dev.boot());
    assert_eq!(event, LogEvent::DeviceDecommissioned);
    assert_eq!(pattern, LedPattern(0b1111));
    assert!(!dev.sim.se.has_object(AES_AUTH_OBJ));
    assert!(!dev.sim.se.mandated());
    let map = dev.cfg.memory.clone();
    assert_eq!(dev.read(map.key_store.start, 4), vec![0xFF; 4]);
    assert_eq!(dev.read(map.main_fw.start, 4), vec![0xFF; 4]);

    // The blank device cannot be provisioned again
    dev.sim.panel = SimPanel::default();
    let (event, _) = halted(&dev.boot());
    assert_eq!(event, LogEvent::DeviceDecommissioned);
}

#[test]
fn unknown_state_is_fatal_and_untouched() {
    let mut dev = Device::provisioned(1, 1);
    dev.set_fw_state(0x03);
    let (event, pattern) = halted(&dev.boot());
    assert_eq!(event, LogEvent::UnknownFWReturnStatus);
    assert_eq!(pattern, LedPattern::OFF);
    assert_eq!(dev.fw_state(), 0x03);
}

#[test]
fn unrecorded_revert_request_halts_instead_of_resetting() {
    let mut dev = Device::provisioned(2, 1);
    dev.sim.soc.peer = Peer::Never;
    // The revert bit no longer sticks
    dev.sim.gpr.stuck_low = 0x0100_0000;
    let (event, pattern) = halted(&dev.boot());
    assert_eq!(event, LogEvent::FwExecutionFailed);
    assert_eq!(pattern, LedPattern(0b1001));
}

#[test]
fn unverifiable_state_write_is_reported() {
    let mut dev = Device::provisioned(1, 1);
    let path = dev.cfg.update_file.clone();
    let pkg = dev.package(2, 2);
    dev.insert_media(&[(&path, pkg)]);
    // VerifyRequested cannot be stored
    dev.sim.gpr.stuck_low = 0x1000_0000;

    let report = dev.boot();
    assert_eq!(report.events, vec![LogEvent::SvnsLpGprOpFailed]);
    assert_eq!(dev.sim.se.version(MAN_VERSION), Some(0));
}

#[test]
fn events_reach_the_encrypted_log() {
    let mut dev = Device::provisioned(2, 1);
    dev.set_fw_state(0x12);
    dev.boot();
    let slot = dev.read(dev.cfg.memory.event_log.start, 32);
    assert_eq!(&slot[..4], b"QLG1");
}

/// Authenticates a sealed image in the main slot of a fresh device
fn authenticate_main(dev: &mut Device, image: &[u8], trusted: u32) -> Result<auth::Entry, Error> {
    let map = dev.cfg.memory.clone();
    dev.put(map.main_fw.start, image);
    let channel = dev.sim.se.channel_keys().clone();
    let mut nor = Nor::new(&mut dev.sim.flash, 1);
    let mut session = Session::open(&mut dev.sim.se, &channel, 1)?;
    let hdr = auth::read_header(&mut nor, map.main_fw.start)?;
    auth::authenticate(&mut nor, &mut session, &hdr, trusted, map.main_fw)
}

#[test]
fn anti_rollback_boundary() {
    let mut dev = Device::new();
    let image = dev.image(5);
    assert!(authenticate_main(&mut dev, &image, 5).is_ok());
    assert!(matches!(
        authenticate_main(&mut dev, &image, 6),
        Err(Error::RollbackRejected {
            version: 5,
            trusted: 6
        })
    ));
}

#[test]
fn vector_table_at_the_extent_boundary() {
    let mut dev = Device::new();
    let mut spec = dev.spec(5);
    // The last eight bytes of the image form a second vector table
    let base = spec.base;
    spec.secondary[0x38..0x3C].copy_from_slice(&0x2000_8000u32.to_le_bytes());
    spec.secondary[0x3C..].copy_from_slice(&((base + 0x108) | 1).to_le_bytes());
    let (mut hdr, body) = spec.layout();
    let end = hdr.fw_data_addr + hdr.fw_data_length;

    hdr.cm7_vector_table_addr = end - 8;
    let exact = seal(&hdr, &body, &dev.fw_key).unwrap();
    assert!(authenticate_main(&mut dev, &exact, 0).is_ok());

    hdr.cm7_vector_table_addr = end - 7;
    let past = seal(&hdr, &body, &dev.fw_key).unwrap();
    assert!(matches!(
        authenticate_main(&mut dev, &past, 0),
        Err(Error::ExtentViolation {
            what: "vector table",
            ..
        })
    ));
}

#[test]
fn layout_violation_is_independent_of_the_signature() {
    let mut dev = Device::new();
    let (mut hdr, body) = dev.spec(1).layout();
    hdr.cm4_boot_addr = INIT_DATA_ADDR - 0x20;
    let image = seal(&hdr, &body, &dev.fw_key).unwrap();
    assert!(matches!(
        authenticate_main(&mut dev, &image, 0),
        Err(Error::ExtentViolation {
            what: "secondary boot address",
            ..
        })
    ));
}

#[test]
fn first_of_several_violations_is_reported() {
    let mut dev = Device::new();
    let (mut hdr, body) = dev.spec(1).layout();
    hdr.cm7_vector_table_addr = hdr.fw_data_addr + hdr.fw_data_length;
    hdr.cm4_boot_addr = INIT_DATA_ADDR - 0x20;
    let image = seal(&hdr, &body, &dev.fw_key).unwrap();
    assert!(matches!(
        authenticate_main(&mut dev, &image, 0),
        Err(Error::ExtentViolation {
            what: "vector table",
            ..
        })
    ));
}

#[test]
fn hand_off_keeps_the_policy_key_private() {
    let mut dev = Device::provisioned(1, 1);
    let map = dev.cfg.memory.clone();
    let mut nor = Nor::new(&mut dev.sim.flash, 1);
    let keys = keys::reconstruct_keys(&mut nor, &mut dev.sim.puf, map.key_store).unwrap();
    let handed = dev.sim.soc.peek(CHANNEL_KEYS_ADDR, 48).unwrap();
    assert!(handed.windows(16).all(|w| w != keys.policy.0));
}
