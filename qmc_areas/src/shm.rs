// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structures shared with the secondary core
//!
//! [`SecWdInitData`] is the one-shot bootstrap bundle for the secure watchdog.
//! [`RpcShm`] is the command mailbox the application and the secondary core
//! use after boot; the boot path only puts it into its initial state.

use crate::LayoutError;
use byteorder::LittleEndian;
use secwd_token::{MAX_MSG_SIZE, MAX_PK_SIZE, MAX_RNG_SEED_SIZE};
use zerocopy::{AsBytes, FromBytes, Unaligned, U16, U32};

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct SecWdInitData {
    pub rng_seed: [u8; MAX_RNG_SEED_SIZE],
    pub rng_seed_len: U32<LittleEndian>,
    pub pk: [u8; MAX_PK_SIZE],
    pub pk_len: U32<LittleEndian>,
    pub ready: u8,
}

impl SecWdInitData {
    pub const SIZE: usize = std::mem::size_of::<SecWdInitData>();

    pub fn new(seed: &[u8], pk: &[u8]) -> Result<Self, LayoutError> {
        if seed.len() > MAX_RNG_SEED_SIZE {
            return Err(LayoutError::TooLong {
                what: "rng seed",
                len: seed.len(),
                max: MAX_RNG_SEED_SIZE,
            });
        }
        if pk.len() > MAX_PK_SIZE {
            return Err(LayoutError::TooLong {
                what: "public key",
                len: pk.len(),
                max: MAX_PK_SIZE,
            });
        }
        let mut d = Self::new_zeroed();
        d.rng_seed[..seed.len()].copy_from_slice(seed);
        d.rng_seed_len = U32::new(seed.len() as u32);
        d.pk[..pk.len()].copy_from_slice(pk);
        d.pk_len = U32::new(pk.len() as u32);
        Ok(d)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, LayoutError> {
        Self::read_from_prefix(bytes).ok_or(LayoutError::TooShort {
            have: bytes.len(),
            need: Self::SIZE,
        })
    }

    /// Offset of the readiness byte from the start of the structure
    pub const fn ready_offset() -> usize {
        MAX_RNG_SEED_SIZE + 4 + MAX_PK_SIZE + 4
    }
}

/// Dispatch status at the head of every mailbox slot
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct RpcStatus {
    pub is_new: u8,
    pub is_processed: u8,
    pub wait_async: u8,
    pub pad: u8,
    pub retval: U32<LittleEndian>,
}

impl RpcStatus {
    /// Idle slot, ready for the caller
    pub fn idle() -> Self {
        Self {
            is_processed: 1,
            ..Default::default()
        }
    }

    /// Caller side: publish a request into a slot that has been processed
    ///
    /// Returns false if the previous request is still outstanding.
    pub fn post(&mut self) -> bool {
        if self.is_processed == 0 {
            return false;
        }
        self.is_processed = 0;
        self.is_new = 1;
        true
    }

    /// Callee side: claim a new request at most once
    pub fn take(&mut self) -> bool {
        if self.is_new == 0 {
            return false;
        }
        self.is_new = 0;
        true
    }

    /// Callee side: report completion
    pub fn complete(&mut self, retval: u32) {
        self.retval = U32::new(retval);
        self.is_processed = 1;
    }
}

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct EventsSlot {
    pub status: RpcStatus,
    pub pending: U32<LittleEndian>,
}

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct FuncWdSlot {
    pub status: RpcStatus,
}

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct SecWdSlot {
    pub status: RpcStatus,
    pub is_nonce_not_kick: u8,
    pub data_len: U32<LittleEndian>,
    pub data: [u8; MAX_MSG_SIZE],
}

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct GpioOutSlot {
    pub status: RpcStatus,
    pub value: U16<LittleEndian>,
}

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct RtcSlot {
    pub status: RpcStatus,
    pub is_set: u8,
    pub seconds: U32<LittleEndian>,
}

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct FwUpdateSlot {
    pub status: RpcStatus,
    pub fw_state: u8,
}

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct ResetSlot {
    pub status: RpcStatus,
    pub cause: U32<LittleEndian>,
}

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct TemperatureSlot {
    pub status: RpcStatus,
    pub millidegrees: U32<LittleEndian>,
}

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct MemWriteSlot {
    pub status: RpcStatus,
    pub address: U32<LittleEndian>,
    pub length: U32<LittleEndian>,
    pub data: [u8; 64],
}

/// The command mailbox
#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct RpcShm {
    pub events: EventsSlot,
    pub func_wd: FuncWdSlot,
    pub sec_wd: SecWdSlot,
    pub gpio_out: GpioOutSlot,
    pub rtc: RtcSlot,
    pub fw_update: FwUpdateSlot,
    pub reset: ResetSlot,
    pub temperature: TemperatureSlot,
    pub mem_write: MemWriteSlot,
}

impl RpcShm {
    pub const SIZE: usize = std::mem::size_of::<RpcShm>();

    /// Every slot idle and every payload zero
    pub fn boot_default() -> Self {
        let mut shm = Self::new_zeroed();
        for status in shm.statuses_mut() {
            *status = RpcStatus::idle();
        }
        shm
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, LayoutError> {
        Self::read_from_prefix(bytes).ok_or(LayoutError::TooShort {
            have: bytes.len(),
            need: Self::SIZE,
        })
    }

    pub fn statuses(&self) -> [&RpcStatus; 9] {
        [
            &self.events.status,
            &self.func_wd.status,
            &self.sec_wd.status,
            &self.gpio_out.status,
            &self.rtc.status,
            &self.fw_update.status,
            &self.reset.status,
            &self.temperature.status,
            &self.mem_write.status,
        ]
    }

    pub fn statuses_mut(&mut self) -> [&mut RpcStatus; 9] {
        [
            &mut self.events.status,
            &mut self.func_wd.status,
            &mut self.sec_wd.status,
            &mut self.gpio_out.status,
            &mut self.rtc.status,
            &mut self.fw_update.status,
            &mut self.reset.status,
            &mut self.temperature.status,
            &mut self.mem_write.status,
        ]
    }
}
