// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event log and diagnostic encoder
//!
//! Every recorded event is mirrored to the `log` facade.  Once the log keys
//! are loaded, events are also appended to the encrypted event-log region
//! in flash, one 32-byte slot per event.  Recording never fails: a full
//! region or a flash error is reported on the debug stream and the record is
//! dropped.

use crate::{flash::Nor, Error};
use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes256;
use byteorder::{ByteOrder, LittleEndian};
use crc_any::CRCu16;
use log::{info, trace, warn};
use num_derive::{FromPrimitive, ToPrimitive};
use qmc_areas::Extent;
use serde::Serialize;
use strum_macros::{Display, EnumIter, EnumString};
use zerocopy::{AsBytes, FromBytes, Unaligned, U16, U32};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Source tag of every record written by the boot path
pub const LOG_SOURCE: u8 = 0x13;

/// Record type of a system-data record
pub const RECORD_SYSTEM_DATA: u32 = 0x04;

pub const RECORD_MAGIC: [u8; 4] = *b"QLG1";
pub const RECORD_SIZE: u32 = 32;

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    FromPrimitive,
    ToPrimitive,
    Display,
    EnumString,
    EnumIter,
    Serialize,
)]
#[repr(u16)]
pub enum LogEvent {
    Scp03ConnFailed = 0x43,
    Scp03KeyReconFailed = 0x44,
    NewFWReverted = 0x45,
    NewFWRevertFailed = 0x46,
    NewFWCommitted = 0x47,
    NewFWCommitFailed = 0x48,
    AwdtExpired = 0x49,
    CfgDataBackedUp = 0x4A,
    CfgDataBackUpFailed = 0x4B,
    MainFwAuthFailed = 0x4C,
    FwuAuthFailed = 0x4D,
    StackError = 0x4E,
    KeyRevocation = 0x4F,
    InvalidFwuVersion = 0x50,
    ExtMemOprFailed = 0x51,
    BackUpImgAuthFailed = 0x52,
    SdCardFailed = 0x53,
    HwInitDeinitFailed = 0x54,
    SvnsLpGprOpFailed = 0x55,
    Scp03KeyRotationFailed = 0x56,
    DecommissioningFailed = 0x57,
    VerReadFromSeFailed = 0x58,
    FwExecutionFailed = 0x59,
    FwuCommitFailed = 0x5A,
    DeviceDecommissioned = 0x5B,
    RpcInitFailed = 0x5C,
    UnknownFWReturnStatus = 0x5D,
    /// Placeholder; never recorded
    NoLogEntry = 0x5E,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Category {
    General = 0,
    Fault = 1,
    Authentication = 2,
}

impl LogEvent {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<LogEvent> {
        num_traits::FromPrimitive::from_u16(code)
    }

    pub fn category(self) -> Category {
        use LogEvent::*;
        match self {
            NewFWReverted | NewFWCommitted | AwdtExpired | CfgDataBackedUp
            | DeviceDecommissioned | NoLogEntry => Category::General,
            MainFwAuthFailed | FwuAuthFailed | BackUpImgAuthFailed | KeyRevocation
            | InvalidFwuVersion => Category::Authentication,
            _ => Category::Fault,
        }
    }
}

/// State of the four indicator lines, lowest bit is line 0
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LedPattern(pub u8);

impl LedPattern {
    pub const OFF: LedPattern = LedPattern(0b0000);
}

impl std::fmt::Display for LedPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04b}", self.0 & 0xF)
    }
}

/// Maps a fatal event to the pattern shown while halted
pub fn encode_visual(event: LogEvent) -> LedPattern {
    use LogEvent::*;
    LedPattern(match event {
        Scp03ConnFailed => 0b0110,
        Scp03KeyReconFailed => 0b0101,
        NewFWRevertFailed => 0b1010,
        NewFWCommitFailed => 0b1011,
        CfgDataBackUpFailed => 0b1100,
        ExtMemOprFailed => 0b1000,
        BackUpImgAuthFailed => 0b1101,
        SdCardFailed => 0b0010,
        HwInitDeinitFailed => 0b0001,
        SvnsLpGprOpFailed => 0b0011,
        Scp03KeyRotationFailed => 0b0100,
        DecommissioningFailed => 0b1110,
        VerReadFromSeFailed => 0b0111,
        FwExecutionFailed => 0b1001,
        DeviceDecommissioned => 0b1111,
        _ => return LedPattern::OFF,
    })
}

/// User buttons and indicator lines
pub trait Panel {
    fn buttons_pressed(&mut self) -> bool;
    fn show(&mut self, pattern: LedPattern);
}

/// Encryption provider for log records
pub trait LogCipher {
    fn load_keys(&mut self, key: &[u8; 32], nonce: &[u8; 16]) -> Result<(), Error>;

    /// Encrypts one 16-byte record block in place
    fn encrypt(&mut self, seq: u32, block: &mut [u8; 16]) -> Result<(), Error>;
}

/// AES-256 in counter mode over single-block records
///
/// The counter block is the nonce with the sequence number added to its
/// last little-endian word.  The key schedule and the nonce are wiped on
/// drop.
#[derive(Default)]
pub struct AesCtrCipher {
    cipher: Option<Aes256>,
    nonce: [u8; 16],
}

impl AesCtrCipher {
    pub fn counter_block(&self, seq: u32) -> [u8; 16] {
        let mut block = self.nonce;
        let ctr = LittleEndian::read_u32(&block[12..]).wrapping_add(seq);
        LittleEndian::write_u32(&mut block[12..], ctr);
        block
    }
}

impl LogCipher for AesCtrCipher {
    fn load_keys(&mut self, key: &[u8; 32], nonce: &[u8; 16]) -> Result<(), Error> {
        self.cipher = Some(Aes256::new(GenericArray::from_slice(key)));
        self.nonce = *nonce;
        Ok(())
    }

    fn encrypt(&mut self, seq: u32, block: &mut [u8; 16]) -> Result<(), Error> {
        let ks = self.counter_block(seq);
        let cipher = self.cipher.as_ref().ok_or(Error::Cipher("no key loaded"))?;
        let mut ks: aes::Block = ks.into();
        cipher.encrypt_block(&mut ks);
        for (b, k) in block.iter_mut().zip(ks.iter()) {
            *b ^= k;
        }
        Ok(())
    }
}

impl Drop for AesCtrCipher {
    fn drop(&mut self) {
        self.cipher = None;
        self.nonce.zeroize();
    }
}

impl ZeroizeOnDrop for AesCtrCipher {}

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct PlainRecord {
    record_type: U32<LittleEndian>,
    source: u8,
    category: u8,
    code: U16<LittleEndian>,
    seq: U32<LittleEndian>,
    user: U16<LittleEndian>,
    reserved: U16<LittleEndian>,
}

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct LogRecord {
    pub magic: [u8; 4],
    pub seq: U32<LittleEndian>,
    pub ciphertext: [u8; 16],
    pub crc: U16<LittleEndian>,
    pub pad: [u8; 6],
}

fn record_crc(bytes: &[u8]) -> u16 {
    let mut crc = CRCu16::crc16xmodem();
    crc.digest(&bytes[..24]);
    crc.get_crc()
}

impl LogRecord {
    pub fn seal(
        cipher: &mut dyn LogCipher,
        event: LogEvent,
        seq: u32,
    ) -> Result<LogRecord, Error> {
        let plain = PlainRecord {
            record_type: U32::new(RECORD_SYSTEM_DATA),
            source: LOG_SOURCE,
            category: event.category() as u8,
            code: U16::new(event.code()),
            seq: U32::new(seq),
            user: U16::new(0),
            reserved: U16::new(0),
        };
        let mut block = [0u8; 16];
        block.copy_from_slice(plain.as_bytes());
        cipher.encrypt(seq, &mut block)?;
        let mut rec = LogRecord {
            magic: RECORD_MAGIC,
            seq: U32::new(seq),
            ciphertext: block,
            crc: U16::new(0),
            pad: [0xFF; 6],
        };
        let crc = record_crc(rec.as_bytes());
        rec.crc = U16::new(crc);
        Ok(rec)
    }

    /// Parses a slot and checks its framing
    pub fn parse(slot: &[u8]) -> Option<LogRecord> {
        let rec = LogRecord::read_from_prefix(slot)?;
        if rec.magic != RECORD_MAGIC || record_crc(rec.as_bytes()) != rec.crc.get() {
            return None;
        }
        Some(rec)
    }

    /// Decrypts the record; in counter mode this is the same operation
    pub fn open(&self, cipher: &mut dyn LogCipher) -> Result<(u16, u32), Error> {
        let mut block = self.ciphertext;
        cipher.encrypt(self.seq.get(), &mut block)?;
        let plain = PlainRecord::read_from(&block[..]).ok_or(Error::Cipher("short record"))?;
        Ok((plain.code.get(), plain.seq.get()))
    }
}

/// One decrypted slot of the event-log region
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoggedEvent {
    pub addr: u32,
    pub seq: u32,
    pub code: u16,
    pub event: Option<LogEvent>,
}

/// Decrypts every framed record up to the first blank slot
///
/// Slots that fail framing or whose plaintext sequence disagrees with the
/// header are skipped.
pub fn read_log(
    flash: &mut Nor,
    region: Extent,
    cipher: &mut dyn LogCipher,
) -> Result<Vec<LoggedEvent>, Error> {
    let mut out = vec![];
    let mut addr = region.start;
    while u64::from(addr) + u64::from(RECORD_SIZE) <= region.end() {
        let slot = flash.read_vec(addr, RECORD_SIZE as usize)?;
        if slot.iter().all(|b| *b == 0xFF) {
            break;
        }
        match LogRecord::parse(&slot) {
            Some(rec) => {
                let (code, seq) = rec.open(cipher)?;
                if seq == rec.seq.get() {
                    out.push(LoggedEvent {
                        addr,
                        seq,
                        code,
                        event: LogEvent::from_code(code),
                    });
                } else {
                    warn!("record at {addr:#010x} does not decrypt");
                }
            }
            None => warn!("damaged record at {addr:#010x}"),
        }
        addr += RECORD_SIZE;
    }
    Ok(out)
}

/// Where the next record goes
#[derive(Copy, Clone, Debug)]
struct Cursor {
    addr: u32,
    seq: u32,
}

pub struct EventRecorder {
    region: Extent,
    enabled: bool,
    cursor: Option<Cursor>,
    pending: Vec<LogEvent>,
    history: Vec<LogEvent>,
}

impl EventRecorder {
    pub fn new(region: Extent) -> Self {
        Self {
            region,
            enabled: false,
            cursor: None,
            pending: vec![],
            history: vec![],
        }
    }

    /// Starts queueing records for the flash log
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Stops queueing and drops anything not yet written
    pub fn disable(&mut self) {
        self.enabled = false;
        self.pending.clear();
    }

    pub fn record(&mut self, event: LogEvent) {
        if event == LogEvent::NoLogEntry {
            return;
        }
        match event.category() {
            Category::General => info!("event {event} ({:#04x})", event.code()),
            _ => warn!("event {event} ({:#04x})", event.code()),
        }
        self.history.push(event);
        if self.enabled {
            self.pending.push(event);
        }
    }

    pub fn history(&self) -> &[LogEvent] {
        &self.history
    }

    pub fn into_history(self) -> Vec<LogEvent> {
        self.history
    }

    fn find_cursor(&self, flash: &mut Nor) -> Result<Option<Cursor>, Error> {
        let mut seq = 0;
        let mut addr = self.region.start;
        while u64::from(addr) + u64::from(RECORD_SIZE) <= self.region.end() {
            let slot = flash.read_vec(addr, RECORD_SIZE as usize)?;
            if slot.iter().all(|b| *b == 0xFF) {
                return Ok(Some(Cursor { addr, seq }));
            }
            if let Some(rec) = LogRecord::parse(&slot) {
                seq = rec.seq.get().wrapping_add(1);
            }
            addr += RECORD_SIZE;
        }
        Ok(None)
    }

    /// Writes queued records to flash; best effort
    pub fn persist(&mut self, flash: &mut Nor, cipher: &mut dyn LogCipher) {
        if self.pending.is_empty() {
            return;
        }
        if self.cursor.is_none() {
            match self.find_cursor(flash) {
                Ok(c) => self.cursor = c,
                Err(e) => warn!("event log scan failed: {e}"),
            }
        }
        for event in std::mem::take(&mut self.pending) {
            let Some(cursor) = self.cursor else {
                warn!("event log full, dropping {event}");
                continue;
            };
            let written = LogRecord::seal(cipher, event, cursor.seq)
                .and_then(|rec| flash.program(cursor.addr, rec.as_bytes()));
            if let Err(e) = written {
                warn!("could not log {event}: {e}");
            }
            // A failed slot is skipped
            let next = cursor.addr + RECORD_SIZE;
            self.cursor = (u64::from(next) + u64::from(RECORD_SIZE) <= self.region.end())
                .then_some(Cursor {
                    addr: next,
                    seq: cursor.seq.wrapping_add(1),
                });
            trace!("logged {event} at {:#010x}", cursor.addr);
        }
    }
}
