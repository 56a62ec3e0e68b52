// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Hand-off constants shared by the boot core and the secure-watchdog core
//!
//! Before the application image runs, the boot core passes the secondary core
//! a one-shot bundle: a random seed and a verification public key for its
//! secure watchdog.  The bundle lives at a fixed address at the top of the
//! secondary core's tightly coupled RAM.  The secondary core consumes it and
//! answers by writing [`READY`] into the readiness byte; the boot core polls
//! for that byte and then scrubs the seed and key.
//!
//! The same physical memory also hosts the command mailbox used after boot
//! and the two key hand-off areas read by the application image.  All of
//! these addresses are fixed by the linker configuration of both images and
//! must not move independently.
#![no_std]

/// Base of the secondary core's boot RAM (its vector table is copied here)
pub const CORE1_RAM_BASE: u32 = 0x2020_0000;

/// Size of the secondary core's boot RAM
pub const CORE1_RAM_SIZE: u32 = 0x0004_0000;

/// Address of the secure-watchdog bootstrap structure
///
/// This is the last 256 bytes of the secondary core's boot RAM.  A secondary
/// image copied to [`CORE1_RAM_BASE`] must end at or below this address.
pub const INIT_DATA_ADDR: u32 = 0x2023_FF00;

/// Size reserved for the bootstrap structure
pub const INIT_DATA_SIZE: u32 = 0x100;

/// The secondary core has consumed the bootstrap bundle
///
/// This value is only written by the secondary core
pub const READY: u8 = 0x01;

/// Capacity of the seed field
pub const MAX_RNG_SEED_SIZE: usize = 48;

/// Capacity of the public key field
pub const MAX_PK_SIZE: usize = 158;

/// Capacity of a secure-watchdog nonce or kick message in the mailbox
pub const MAX_MSG_SIZE: usize = 150;

/// Address of the post-boot command mailbox
pub const RPC_SHM_ADDR: u32 = 0x2034_0000;

/// Size of the shared window holding the mailbox and the key hand-off areas
pub const SHM_SIZE: u32 = 0x0001_0000;

/// Address at which the application expects its log keys and nonces
pub const LOG_KEYS_ADDR: u32 = 0x2034_FC00;

/// Address at which the application expects its secure-element channel keys
pub const CHANNEL_KEYS_ADDR: u32 = 0x2034_FC80;
