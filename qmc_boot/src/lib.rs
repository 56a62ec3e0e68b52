// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Write as _;

pub mod auth;
pub mod boot;
pub mod config;
pub mod decommission;
pub mod event;
pub mod flash;
pub mod keys;
pub mod persist;
pub mod recovery;
pub mod se;
pub mod secwd;
pub mod sign;
pub mod sim;
pub mod update;

pub use boot::{Board, BootReport, Bootloader, Outcome};
pub use config::BootConfig;
pub use event::{LedPattern, LogEvent};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("session key reconstruction failed: {0}")]
    KeyReconstruction(&'static str),

    #[error("secure channel error: {0}")]
    Channel(&'static str),

    #[error("secure element error: {op} on object {id:#04x}")]
    SecureElement { op: &'static str, id: u32 },

    #[error("device is not commissioned")]
    NotCommissioned,

    #[error("device has been decommissioned")]
    Decommissioned,

    #[error("header parse error: {0}")]
    HeaderParse(#[from] qmc_areas::LayoutError),

    #[error("invalid memory map: {0}")]
    MemoryMap(qmc_areas::LayoutError),

    #[error("malformed signature: {0}")]
    SignatureMalformed(&'static str),

    #[error("signature rejected by the secure element")]
    SignatureRejected,

    #[error("version {version} is older than trusted version {trusted}")]
    RollbackRejected { version: u32, trusted: u32 },

    #[error("extent violation: {what} at {addr:#010x}")]
    ExtentViolation { what: &'static str, addr: u32 },

    #[error("state read-back mismatch: wrote {wrote:#010x}, read {read:#010x}")]
    StateReadback { wrote: u32, read: u32 },

    #[error("unknown firmware state {0:#04x}")]
    UnknownState(u8),

    #[error("flash {op} failed at {addr:#010x} (+{len:#x})")]
    Flash {
        op: &'static str,
        addr: u32,
        len: usize,
    },

    #[error("compare mismatch at {addr:#010x}")]
    Compare { addr: u32 },

    #[error("{what} does not fit: {len:#x} bytes, room for {max:#x}")]
    TooLarge {
        what: &'static str,
        len: u64,
        max: u64,
    },

    #[error("secondary core not ready after {attempts} polls")]
    BootstrapTimeout { attempts: u32 },

    #[error("shared RAM access failed at {addr:#010x}")]
    SharedRam { addr: u32 },

    #[error("removable media error: {0}")]
    Media(&'static str),

    #[error("log cipher error: {0}")]
    Cipher(&'static str),

    #[error("invalid configuration: {0}")]
    BadConfig(&'static str),

    #[error("configuration parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("struct packing error: {0}")]
    PackingError(#[from] packed_struct::PackingError),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("hex decode error: {0}")]
    HexError(#[from] hex::FromHexError),

    #[error("DER error: {0}")]
    DerError(#[from] der::Error),

    #[error("RSA PKCS#8 error: {0}")]
    RsaPkcs8Error(#[from] rsa::pkcs8::Error),

    #[error("RSA SPKI error: {0}")]
    RsaSpkiError(#[from] rsa::pkcs8::spki::Error),

    #[error("RSA error while signing: {0}")]
    SigningError(rsa::errors::Error),
}

/// Runs `f` up to `attempts` times, surfacing the last error
pub fn with_attempts<T>(
    what: &str,
    attempts: u32,
    mut f: impl FnMut() -> Result<T, Error>,
) -> Result<T, Error> {
    let mut n = 1;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if n >= attempts => return Err(e),
            Err(e) => {
                log::trace!("{what}: attempt {n}/{attempts} failed: {e}");
                n += 1;
            }
        }
    }
}

/// Boot stage that emitted a record, from its module path
fn boot_stage(target: &str) -> &str {
    let mut parts = target.split("::");
    match (parts.next(), parts.next()) {
        (Some("qmc_boot"), Some(stage)) => stage,
        (Some(krate), _) => krate,
        (None, _) => "",
    }
}

/// Initializes the boot trace logger
///
/// Every line is tagged with the stage that emitted it.  `RUST_LOG` still
/// applies on top of the level picked by `verbose`.
pub fn init_boot_logger(verbose: bool) {
    use env_logger::fmt::Color;

    let level = if verbose {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("qmc_boot", level)
        .parse_default_env()
        .format(|buf, record| {
            let mut style = buf.style();
            let tag = match record.level() {
                log::Level::Error => {
                    style.set_color(Color::Red).set_bold(true);
                    "FAIL"
                }
                log::Level::Warn => {
                    style.set_color(Color::Yellow);
                    "WARN"
                }
                log::Level::Info => {
                    style.set_color(Color::Cyan);
                    "BOOT"
                }
                log::Level::Debug => {
                    style.set_color(Color::Green);
                    "OKAY"
                }
                log::Level::Trace => {
                    style.set_color(Color::Blue);
                    ""
                }
            };
            writeln!(
                buf,
                "{:>4} {:<12} {}",
                style.value(tag),
                boot_stage(record.target()),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_surface_last_error() {
        let mut calls = 0;
        let r: Result<(), Error> = with_attempts("flash read", 3, || {
            calls += 1;
            Err(Error::Compare { addr: calls })
        });
        assert_eq!(calls, 3);
        assert!(matches!(r, Err(Error::Compare { addr: 3 })));
    }

    #[test]
    fn attempts_stop_on_success() {
        let mut calls = 0;
        let r = with_attempts("flash read", 3, || {
            calls += 1;
            if calls == 2 {
                Ok(calls)
            } else {
                Err(Error::Media("busy"))
            }
        });
        assert_eq!(r.unwrap(), 2);
    }

    #[test]
    fn records_are_tagged_with_their_stage() {
        assert_eq!(boot_stage("qmc_boot::auth"), "auth");
        assert_eq!(boot_stage("qmc_boot::secwd::tests"), "secwd");
        assert_eq!(boot_stage("qmc_boot"), "qmc_boot");
        assert_eq!(boot_stage("qmc_boot_bin"), "qmc_boot_bin");
    }
}
