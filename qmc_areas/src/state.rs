// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::LayoutError;
use bitfield::bitfield;
use packed_struct::prelude::*;

/// Number of battery-backed general purpose registers
pub const GPR_COUNT: usize = 4;

/// Register holding the durable boot state
pub const STATE_GPR: usize = 0;

/// Request flags left by the previous firmware run
///
/// Bit values: revert `0x01`, commit `0x02`, backup config `0x04`, watchdog
/// expired `0x08`, verify requested `0x10`, timestamp issue `0x20`.
#[derive(PackedStruct, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[packed_struct(size_bytes = "1", bit_numbering = "msb0")]
pub struct FwState {
    #[packed_field(bits = "0..=1")]
    pub reserved: Integer<u8, packed_bits::Bits<2>>,

    #[packed_field(bits = "2")]
    pub timestamp_issue: bool,

    #[packed_field(bits = "3")]
    pub verify_requested: bool,

    /// Sticky: only the orchestrator clears it, and only while acting
    #[packed_field(bits = "4")]
    pub watchdog_expired: bool,

    #[packed_field(bits = "5")]
    pub backup_config: bool,

    #[packed_field(bits = "6")]
    pub commit: bool,

    #[packed_field(bits = "7")]
    pub revert: bool,
}

impl FwState {
    pub fn from_bits(bits: u8) -> Result<Self, LayoutError> {
        Ok(FwState::unpack(&[bits])?)
    }

    pub fn bits(&self) -> Result<u8, LayoutError> {
        Ok(self.pack()?[0])
    }

    pub fn none() -> Self {
        FwState::default()
    }

    /// The state that only keeps the sticky watchdog bit
    pub fn watchdog_only(watchdog_expired: bool) -> Self {
        FwState {
            watchdog_expired,
            ..Default::default()
        }
    }

    pub fn verify() -> Self {
        FwState {
            verify_requested: true,
            ..Default::default()
        }
    }
}

bitfield! {
    /// Raw view of the state register
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct StateWord(u32);
    impl Debug;
    pub u8, fw_state, set_fw_state: 31, 24;
    pub u8, wd_status, set_wd_status: 23, 16;
    pub u16, wd_timer_backup, set_wd_timer_backup: 15, 0;
}

/// The durable boot-state record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BootState {
    pub fw_state: FwState,
    pub wd_status: u8,
    pub wd_timer_backup: u16,
}

impl BootState {
    pub fn from_word(word: u32) -> Result<Self, LayoutError> {
        let w = StateWord(word);
        Ok(Self {
            fw_state: FwState::from_bits(w.fw_state())?,
            wd_status: w.wd_status(),
            wd_timer_backup: w.wd_timer_backup(),
        })
    }

    pub fn to_word(&self) -> Result<u32, LayoutError> {
        let mut w = StateWord(0);
        w.set_fw_state(self.fw_state.bits()?);
        w.set_wd_status(self.wd_status);
        w.set_wd_timer_backup(self.wd_timer_backup);
        Ok(w.0)
    }

    /// Same record with a different request
    pub fn with_fw_state(&self, fw_state: FwState) -> Self {
        Self { fw_state, ..*self }
    }
}
