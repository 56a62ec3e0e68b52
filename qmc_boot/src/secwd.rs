// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Secure-watchdog bootstrap of the secondary core

use crate::{config::BootConfig, flash::Nor, keys, Error};
use log::{debug as okay, info, trace, warn};
use qmc_areas::{FirmwareHeader, RpcShm, SecWdInitData};
use secwd_token::{
    CHANNEL_KEYS_ADDR, INIT_DATA_ADDR, INIT_DATA_SIZE, LOG_KEYS_ADDR, READY, RPC_SHM_ADDR,
};
use zerocopy::AsBytes;
use zeroize::Zeroizing;

/// RAM shared with the secondary core, its reset control, and a delay source
pub trait Soc {
    fn ram_write(&mut self, addr: u32, data: &[u8]) -> Result<(), Error>;
    fn ram_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error>;

    /// Releases the secondary core from reset at `boot_addr`
    fn release_secondary(&mut self, boot_addr: u32) -> Result<(), Error>;

    fn delay_ms(&mut self, ms: u32);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timing {
    pub release_delay_ms: u32,
    pub poll_interval_ms: u32,
    pub poll_attempts: u32,
}

impl From<&BootConfig> for Timing {
    fn from(cfg: &BootConfig) -> Self {
        Self {
            release_delay_ms: cfg.secwd_release_delay_ms,
            poll_interval_ms: cfg.secwd_poll_interval_ms,
            poll_attempts: cfg.secwd_poll_attempts,
        }
    }
}

fn write_verified(soc: &mut dyn Soc, addr: u32, data: &[u8]) -> Result<(), Error> {
    soc.ram_write(addr, data)?;
    let mut back = Zeroizing::new(vec![0u8; data.len()]);
    soc.ram_read(addr, &mut back)?;
    match back.iter().zip(data).position(|(a, b)| a != b) {
        Some(n) => Err(Error::Compare {
            addr: addr + n as u32,
        }),
        None => Ok(()),
    }
}

/// Writes the seed and public key for the secondary core
pub fn stage(soc: &mut dyn Soc, seed: &[u8], pk: &[u8]) -> Result<(), Error> {
    let mut data = SecWdInitData::new(seed, pk)?;
    let r = write_verified(soc, INIT_DATA_ADDR, data.as_bytes());
    data.rng_seed.fill(0);
    data.pk.fill(0);
    r?;
    trace!(
        "bootstrap staged: {} byte seed, {} byte key",
        seed.len(),
        pk.len()
    );
    Ok(())
}

/// Puts the command mailbox into its boot state
pub fn init_mailbox(soc: &mut dyn Soc) -> Result<(), Error> {
    write_verified(soc, RPC_SHM_ADDR, RpcShm::boot_default().as_bytes())?;
    okay!("command mailbox initialized");
    Ok(())
}

/// Copies the nested secondary image to its boot RAM and compares
pub fn load_image(flash: &mut Nor, soc: &mut dyn Soc, hdr: &FirmwareHeader) -> Result<(), Error> {
    let image = flash.read_vec(hdr.cm4_fw_data_addr, hdr.cm4_fw_data_length as usize)?;
    write_verified(soc, hdr.cm4_boot_addr, &image)?;
    trace!(
        "secondary image of {:#x} bytes loaded at {:#010x}",
        image.len(),
        hdr.cm4_boot_addr
    );
    Ok(())
}

/// Releases the secondary core and waits for it to consume the bootstrap
///
/// Returns the number of polls it took.  After success the seed and key
/// fields are zeroed; on timeout they are left for the exit path.
pub fn release(soc: &mut dyn Soc, boot_addr: u32, timing: Timing) -> Result<u32, Error> {
    soc.release_secondary(boot_addr)?;
    soc.delay_ms(timing.release_delay_ms);

    let ready_addr = INIT_DATA_ADDR + SecWdInitData::ready_offset() as u32;
    for poll in 1..=timing.poll_attempts {
        let mut ready = [0u8];
        soc.ram_read(ready_addr, &mut ready)?;
        if ready[0] == READY {
            info!("secondary core ready after {poll} polls");
            scrub_bootstrap(soc)?;
            return Ok(poll);
        }
        soc.delay_ms(timing.poll_interval_ms);
    }
    warn!(
        "secondary core not ready after {} polls",
        timing.poll_attempts
    );
    Err(Error::BootstrapTimeout {
        attempts: timing.poll_attempts,
    })
}

/// Zeroes the seed and key fields
pub fn scrub_bootstrap(soc: &mut dyn Soc) -> Result<(), Error> {
    let secret_len = SecWdInitData::ready_offset();
    soc.ram_write(INIT_DATA_ADDR, &vec![0u8; secret_len])
}

/// Zeroes everything the boot path may have left in shared RAM
///
/// Best effort; every area is attempted even if one fails.
pub fn scrub_shared(soc: &mut dyn Soc) -> Result<(), Error> {
    let areas = [
        (RPC_SHM_ADDR, RpcShm::SIZE),
        (INIT_DATA_ADDR, INIT_DATA_SIZE as usize),
        (LOG_KEYS_ADDR, keys::LOG_KEYS_LEN),
        (CHANNEL_KEYS_ADDR, keys::CHANNEL_KEYS_LEN),
    ];
    let mut result = Ok(());
    for (addr, len) in areas {
        if let Err(e) = soc.ram_write(addr, &vec![0u8; len]) {
            warn!("could not scrub {addr:#010x}: {e}");
            result = Err(e);
        }
    }
    result
}
