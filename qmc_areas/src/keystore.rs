// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::LayoutError;
use zerocopy::{AsBytes, FromBytes, Unaligned};

/// Bytes a key-wrapping unit adds to the key it wraps
pub const KEY_CODE_OVERHEAD: usize = 36;

pub const fn key_code_size(key_len: usize) -> usize {
    key_len + KEY_CODE_OVERHEAD
}

const CODE_16: usize = key_code_size(16);
const CODE_32: usize = key_code_size(32);

/// What an erased key-store sector starts with
pub const BLANK_WORD: u32 = 0xFFFF_FFFF;

/// One wrapped key per field, in flash order
#[derive(Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct KeyStore {
    pub enc: [u8; CODE_16],
    pub mac: [u8; CODE_16],
    pub dek: [u8; CODE_16],
    pub policy: [u8; CODE_16],
    pub log_config_key: [u8; CODE_32],
    pub log_config_nonce: [u8; CODE_16],
    pub log_key: [u8; CODE_32],
    pub log_nonce: [u8; CODE_16],
}

/// Key slots of the wrapping unit, in key-store order
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeySlot {
    Enc,
    Mac,
    Dek,
    Policy,
    LogConfigKey,
    LogConfigNonce,
    LogKey,
    LogNonce,
}

impl KeySlot {
    pub const ALL: [KeySlot; 8] = [
        KeySlot::Enc,
        KeySlot::Mac,
        KeySlot::Dek,
        KeySlot::Policy,
        KeySlot::LogConfigKey,
        KeySlot::LogConfigNonce,
        KeySlot::LogKey,
        KeySlot::LogNonce,
    ];

    /// Hardware slot index handed to the wrapping unit
    pub fn index(self) -> u8 {
        // Slots 0 and 1 belong to the ROM
        self as u8 + 2
    }

    pub fn key_len(self) -> usize {
        match self {
            KeySlot::LogConfigKey | KeySlot::LogKey => 32,
            _ => 16,
        }
    }
}

impl KeyStore {
    pub const SIZE: usize = std::mem::size_of::<KeyStore>();

    pub fn new() -> Self {
        Self::new_zeroed()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, LayoutError> {
        Self::read_from_prefix(bytes).ok_or(LayoutError::TooShort {
            have: bytes.len(),
            need: Self::SIZE,
        })
    }

    /// Returns true if the store has never been written
    pub fn is_blank(bytes: &[u8]) -> bool {
        bytes.len() >= 4 && bytes[..4] == BLANK_WORD.to_le_bytes()
    }

    pub fn code(&self, slot: KeySlot) -> &[u8] {
        match slot {
            KeySlot::Enc => &self.enc,
            KeySlot::Mac => &self.mac,
            KeySlot::Dek => &self.dek,
            KeySlot::Policy => &self.policy,
            KeySlot::LogConfigKey => &self.log_config_key,
            KeySlot::LogConfigNonce => &self.log_config_nonce,
            KeySlot::LogKey => &self.log_key,
            KeySlot::LogNonce => &self.log_nonce,
        }
    }

    pub fn set_code(&mut self, slot: KeySlot, code: &[u8]) -> Result<(), LayoutError> {
        let dst: &mut [u8] = match slot {
            KeySlot::Enc => &mut self.enc,
            KeySlot::Mac => &mut self.mac,
            KeySlot::Dek => &mut self.dek,
            KeySlot::Policy => &mut self.policy,
            KeySlot::LogConfigKey => &mut self.log_config_key,
            KeySlot::LogConfigNonce => &mut self.log_config_nonce,
            KeySlot::LogKey => &mut self.log_key,
            KeySlot::LogNonce => &mut self.log_nonce,
        };
        if dst.len() != code.len() {
            return Err(LayoutError::TooLong {
                what: "key code",
                len: code.len(),
                max: dst.len(),
            });
        }
        dst.copy_from_slice(code);
        Ok(())
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}
