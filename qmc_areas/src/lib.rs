// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-exact layouts used by the secure boot orchestrator
//!
//! Everything in here is shared between the boot path, the application image
//! and the host tooling, so layouts are fixed and little-endian.

pub mod header;
pub mod keystore;
pub mod memory;
pub mod shm;
pub mod state;

pub use header::{FirmwareHeader, UpdateManifest, HEADER_BLOCK_SIZE};
pub use keystore::{KeySlot, KeyStore};
pub use memory::{align_up, Extent, MemoryMap, Region, PAGE_SIZE, SECTOR_SIZE};
pub use shm::{RpcShm, RpcStatus, SecWdInitData};
pub use state::{BootState, FwState};

#[derive(thiserror::Error, Debug)]
pub enum LayoutError {
    #[error("block too short: have {have} bytes, need {need}")]
    TooShort { have: usize, need: usize },

    #[error("bad magic {found:#010x}, expected {expected:#010x}")]
    BadMagic { found: u32, expected: u32 },

    #[error("{what} does not fit: {len} bytes, capacity {max}")]
    TooLong {
        what: &'static str,
        len: usize,
        max: usize,
    },

    #[error("region {0} is not sector aligned")]
    Misaligned(Region),

    #[error("regions {0} and {1} overlap")]
    Overlap(Region, Region),

    #[error("struct packing error: {0}")]
    PackingError(#[from] packed_struct::PackingError),
}
