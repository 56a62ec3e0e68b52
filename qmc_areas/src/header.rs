// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{Extent, LayoutError};
use byteorder::LittleEndian;
use serde::Serialize;
use zerocopy::{AsBytes, FromBytes, Unaligned, U32};

/// Both the firmware header and the update manifest occupy one block
pub const HEADER_BLOCK_SIZE: usize = 256;

pub const HEADER_MAGIC: u32 = 0x456D_1BE8;
pub const MANIFEST_VENDOR_ID: u32 = 0xB5A5_B5A5;

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct RawHeader {
    magic: U32<LittleEndian>,
    version: U32<LittleEndian>,
    fw_data_addr: U32<LittleEndian>,
    fw_data_length: U32<LittleEndian>,
    sign_data_addr: U32<LittleEndian>,
    cm4_fw_data_addr: U32<LittleEndian>,
    cm4_fw_data_length: U32<LittleEndian>,
    cm4_boot_addr: U32<LittleEndian>,
    cm7_vector_table_addr: U32<LittleEndian>,
    cfg_data_addr: U32<LittleEndian>,
    cfg_data_length: U32<LittleEndian>,
}

#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct RawManifest {
    vendor_id: U32<LittleEndian>,
    version: U32<LittleEndian>,
    fw_data_addr: U32<LittleEndian>,
    fw_data_length: U32<LittleEndian>,
    fwu_data_addr: U32<LittleEndian>,
    fwu_data_length: U32<LittleEndian>,
    sign_data_addr: U32<LittleEndian>,
}

fn prefix<T: FromBytes>(block: &[u8]) -> Result<T, LayoutError> {
    T::read_from_prefix(block).ok_or(LayoutError::TooShort {
        have: block.len(),
        need: std::mem::size_of::<T>(),
    })
}

fn to_block(raw: &[u8]) -> [u8; HEADER_BLOCK_SIZE] {
    let mut block = [0u8; HEADER_BLOCK_SIZE];
    block[..raw.len()].copy_from_slice(raw);
    block
}

/// Header at the base of an image slot
///
/// `fw_data_addr` is the start of the signed extent and equals the slot base,
/// so the header is covered by the image signature.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FirmwareHeader {
    pub version: u32,
    pub fw_data_addr: u32,
    pub fw_data_length: u32,
    pub sign_data_addr: u32,
    pub cm4_fw_data_addr: u32,
    pub cm4_fw_data_length: u32,
    pub cm4_boot_addr: u32,
    pub cm7_vector_table_addr: u32,
    pub cfg_data_addr: u32,
    pub cfg_data_length: u32,
}

impl FirmwareHeader {
    pub fn parse(block: &[u8]) -> Result<Self, LayoutError> {
        let raw: RawHeader = prefix(block)?;
        if raw.magic.get() != HEADER_MAGIC {
            return Err(LayoutError::BadMagic {
                found: raw.magic.get(),
                expected: HEADER_MAGIC,
            });
        }
        Ok(Self {
            version: raw.version.get(),
            fw_data_addr: raw.fw_data_addr.get(),
            fw_data_length: raw.fw_data_length.get(),
            sign_data_addr: raw.sign_data_addr.get(),
            cm4_fw_data_addr: raw.cm4_fw_data_addr.get(),
            cm4_fw_data_length: raw.cm4_fw_data_length.get(),
            cm4_boot_addr: raw.cm4_boot_addr.get(),
            cm7_vector_table_addr: raw.cm7_vector_table_addr.get(),
            cfg_data_addr: raw.cfg_data_addr.get(),
            cfg_data_length: raw.cfg_data_length.get(),
        })
    }

    pub fn to_block(&self) -> [u8; HEADER_BLOCK_SIZE] {
        let raw = RawHeader {
            magic: U32::new(HEADER_MAGIC),
            version: U32::new(self.version),
            fw_data_addr: U32::new(self.fw_data_addr),
            fw_data_length: U32::new(self.fw_data_length),
            sign_data_addr: U32::new(self.sign_data_addr),
            cm4_fw_data_addr: U32::new(self.cm4_fw_data_addr),
            cm4_fw_data_length: U32::new(self.cm4_fw_data_length),
            cm4_boot_addr: U32::new(self.cm4_boot_addr),
            cm7_vector_table_addr: U32::new(self.cm7_vector_table_addr),
            cfg_data_addr: U32::new(self.cfg_data_addr),
            cfg_data_length: U32::new(self.cfg_data_length),
        };
        to_block(raw.as_bytes())
    }

    /// The signed extent
    pub fn extent(&self) -> Extent {
        Extent::new(self.fw_data_addr, self.fw_data_length)
    }

    /// The nested secondary-core image
    pub fn cm4_extent(&self) -> Extent {
        Extent::new(self.cm4_fw_data_addr, self.cm4_fw_data_length)
    }

    pub fn cfg_extent(&self) -> Extent {
        Extent::new(self.cfg_data_addr, self.cfg_data_length)
    }
}

/// Manifest at the base of an update package
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct UpdateManifest {
    pub version: u32,
    pub fw_data_addr: u32,
    pub fw_data_length: u32,
    pub fwu_data_addr: u32,
    pub fwu_data_length: u32,
    pub sign_data_addr: u32,
}

impl UpdateManifest {
    /// Returns true if `block` starts with the vendor tag
    pub fn is_tagged(block: &[u8]) -> bool {
        prefix::<U32<LittleEndian>>(block)
            .map(|v| v.get() == MANIFEST_VENDOR_ID)
            .unwrap_or(false)
    }

    pub fn parse(block: &[u8]) -> Result<Self, LayoutError> {
        let raw: RawManifest = prefix(block)?;
        if raw.vendor_id.get() != MANIFEST_VENDOR_ID {
            return Err(LayoutError::BadMagic {
                found: raw.vendor_id.get(),
                expected: MANIFEST_VENDOR_ID,
            });
        }
        Ok(Self {
            version: raw.version.get(),
            fw_data_addr: raw.fw_data_addr.get(),
            fw_data_length: raw.fw_data_length.get(),
            fwu_data_addr: raw.fwu_data_addr.get(),
            fwu_data_length: raw.fwu_data_length.get(),
            sign_data_addr: raw.sign_data_addr.get(),
        })
    }

    pub fn to_block(&self) -> [u8; HEADER_BLOCK_SIZE] {
        let raw = RawManifest {
            vendor_id: U32::new(MANIFEST_VENDOR_ID),
            version: U32::new(self.version),
            fw_data_addr: U32::new(self.fw_data_addr),
            fw_data_length: U32::new(self.fw_data_length),
            fwu_data_addr: U32::new(self.fwu_data_addr),
            fwu_data_length: U32::new(self.fwu_data_length),
            sign_data_addr: U32::new(self.sign_data_addr),
        };
        to_block(raw.as_bytes())
    }

    /// The signed extent of the package
    pub fn extent(&self) -> Extent {
        Extent::new(self.fwu_data_addr, self.fwu_data_length)
    }

    /// The packaged firmware image, signature included
    pub fn image_extent(&self) -> Extent {
        Extent::new(self.fw_data_addr, self.fw_data_length)
    }
}
