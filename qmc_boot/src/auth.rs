// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware authenticator
//!
//! Checks run in a fixed order: anti-rollback, execution extents, signature
//! framing, digest, and finally the signature itself.  The extent checks
//! never depend on the signature, so a correctly signed image with a bad
//! layout is still rejected.

use crate::{
    flash::Nor,
    se::{Session, FWU_PUB_KEY, FW_PUB_KEY},
    Error,
};
use der::{Decode as _, Encode as _, Header, SliceReader, Tag};
use log::{debug as okay, trace};
use qmc_areas::{Extent, FirmwareHeader, UpdateManifest, HEADER_BLOCK_SIZE, PAGE_SIZE};
use secwd_token::{CORE1_RAM_BASE, INIT_DATA_ADDR};
use serde::Serialize;
use sha2::{Digest as _, Sha512};

/// Largest detached signature accepted, DER framing included
pub const MAX_SIGNATURE_LEN: usize = 512;

/// Bytes needed to decode any accepted DER length prefix
const DER_PREFIX_LEN: usize = 5;

fn malformed(_: der::Error) -> Error {
    Error::SignatureMalformed("invalid DER framing")
}

/// Returns the total length of the DER SEQUENCE starting at `prefix`
pub fn signature_len(prefix: &[u8]) -> Result<usize, Error> {
    let mut reader = SliceReader::new(prefix).map_err(malformed)?;
    let header = Header::decode(&mut reader).map_err(malformed)?;
    if header.tag != Tag::Sequence {
        return Err(Error::SignatureMalformed("not a DER sequence"));
    }
    let total = (header.encoded_len().map_err(malformed)? + header.length).map_err(malformed)?;
    let total = usize::try_from(total).map_err(malformed)?;
    if total > MAX_SIGNATURE_LEN {
        return Err(Error::SignatureMalformed("signature too long"));
    }
    Ok(total)
}

fn read_signature(flash: &mut Nor, addr: u32, within: Extent) -> Result<Vec<u8>, Error> {
    let mut prefix = [0u8; DER_PREFIX_LEN];
    flash.read(addr, &mut prefix)?;
    let len = signature_len(&prefix)?;
    if !within.contains_range(addr, len as u64) {
        return Err(Error::ExtentViolation {
            what: "signature",
            addr,
        });
    }
    flash.read_vec(addr, len)
}

/// Reads the length of the detached signature at `sign_addr`
pub fn image_signature_len(flash: &mut Nor, sign_addr: u32) -> Result<usize, Error> {
    let mut prefix = [0u8; DER_PREFIX_LEN];
    flash.read(sign_addr, &mut prefix)?;
    signature_len(&prefix)
}

fn digest(flash: &mut Nor, extent: Extent) -> Result<[u8; 64], Error> {
    let mut sha = Sha512::new();
    let mut buf = [0u8; PAGE_SIZE as usize * 4];
    let mut done = 0u32;
    while done < extent.len {
        let n = (extent.len - done).min(buf.len() as u32) as usize;
        flash.read(extent.start + done, &mut buf[..n])?;
        sha.update(&buf[..n]);
        done += n as u32;
    }
    Ok(sha.finalize().into())
}

pub fn read_header(flash: &mut Nor, base: u32) -> Result<FirmwareHeader, Error> {
    let block = flash.read_vec(base, HEADER_BLOCK_SIZE)?;
    Ok(FirmwareHeader::parse(&block)?)
}

pub fn read_manifest(flash: &mut Nor, base: u32) -> Result<UpdateManifest, Error> {
    let block = flash.read_vec(base, HEADER_BLOCK_SIZE)?;
    Ok(UpdateManifest::parse(&block)?)
}

/// Where execution starts
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub vector_table: u32,
    pub stack_pointer: u32,
    pub reset_vector: u32,
}

fn violation(what: &'static str, addr: u32) -> Error {
    Error::ExtentViolation { what, addr }
}

/// Logs a violation and keeps the first one seen in `$failed`
macro_rules! error {
    ($failed:ident, $what:expr, $addr:expr) => {{
        let (what, addr) = ($what, $addr);
        log::error!("{what} at {addr:#010x} lies outside the image");
        $failed.get_or_insert(violation(what, addr));
    }};
}

/// Checks that everything the image will execute lies inside its extent
///
/// `slot` is the image slot the header was read from.  Every violation is
/// logged; the first one is returned.
pub fn check_execution_extents(
    flash: &mut Nor,
    hdr: &FirmwareHeader,
    slot: Extent,
) -> Result<Entry, Error> {
    let mut failed: Option<Error> = None;
    let extent = hdr.extent();
    if hdr.fw_data_addr != slot.start {
        error!(failed, "image base", hdr.fw_data_addr);
    }
    if (extent.len as usize) < HEADER_BLOCK_SIZE || !slot.contains_extent(&extent) {
        error!(failed, "image extent", hdr.fw_data_addr);
    }
    // The remaining checks are relative to the extent
    if let Some(e) = failed {
        return Err(e);
    }

    let vtor = hdr.cm7_vector_table_addr;
    let mut vectors = None;
    if extent.contains_range(vtor, 8) {
        let stack_pointer = flash.read_u32(vtor)?;
        let reset_vector = flash.read_u32(vtor + 4)?;
        if !extent.contains(reset_vector & !1) {
            error!(failed, "reset vector", reset_vector);
        }
        vectors = Some((stack_pointer, reset_vector));
    } else {
        error!(failed, "vector table", vtor);
    }

    let cm4 = hdr.cm4_extent();
    if cm4.is_empty() || !extent.contains_extent(&cm4) {
        error!(failed, "secondary image", hdr.cm4_fw_data_addr);
    }
    let boot_ram = Extent::new(CORE1_RAM_BASE, INIT_DATA_ADDR - CORE1_RAM_BASE);
    if !boot_ram.contains_range(hdr.cm4_boot_addr, u64::from(cm4.len)) {
        error!(failed, "secondary boot address", hdr.cm4_boot_addr);
    }

    if u64::from(hdr.sign_data_addr) < extent.end() {
        error!(failed, "signature address", hdr.sign_data_addr);
    }

    match (failed, vectors) {
        (Some(e), _) => Err(e),
        (None, Some((stack_pointer, reset_vector))) => {
            trace!(
                "extents ok: image {extent}, vtor {vtor:#010x}, \
                 entry {:#010x}, secondary {cm4}",
                reset_vector & !1
            );
            Ok(Entry {
                vector_table: vtor,
                stack_pointer,
                reset_vector,
            })
        }
        (None, None) => Err(violation("vector table", vtor)),
    }
}

/// Authenticates the firmware image in `slot` against the trusted version
pub fn authenticate(
    flash: &mut Nor,
    session: &mut Session,
    hdr: &FirmwareHeader,
    trusted: u32,
    slot: Extent,
) -> Result<Entry, Error> {
    if hdr.version < trusted {
        return Err(Error::RollbackRejected {
            version: hdr.version,
            trusted,
        });
    }
    let entry = check_execution_extents(flash, hdr, slot)?;
    let sig = read_signature(flash, hdr.sign_data_addr, slot)?;
    let digest = digest(flash, hdr.extent())?;
    session.verify(FW_PUB_KEY, &digest, &sig)?;
    okay!(
        "firmware version {} authenticated (trusted {trusted})",
        hdr.version
    );
    Ok(entry)
}

/// Authenticates an update package staged at `staging`
///
/// A manifest must be strictly newer than the trusted manifest version.
pub fn authenticate_manifest(
    flash: &mut Nor,
    session: &mut Session,
    m: &UpdateManifest,
    trusted: u32,
    staging: Extent,
) -> Result<(), Error> {
    if m.version <= trusted {
        return Err(Error::RollbackRejected {
            version: m.version,
            trusted,
        });
    }
    let extent = m.extent();
    if m.fwu_data_addr != staging.start {
        return Err(violation("package base", m.fwu_data_addr));
    }
    if (extent.len as usize) < HEADER_BLOCK_SIZE || !staging.contains_extent(&extent) {
        return Err(violation("package extent", m.fwu_data_addr));
    }
    let image = m.image_extent();
    if image.is_empty() || !extent.contains_extent(&image) {
        return Err(violation("packaged image", m.fw_data_addr));
    }
    if u64::from(m.sign_data_addr) < extent.end() {
        return Err(violation("signature address", m.sign_data_addr));
    }
    let sig = read_signature(flash, m.sign_data_addr, staging)?;
    let digest = digest(flash, extent)?;
    session.verify(FWU_PUB_KEY, &digest, &sig)?;
    okay!(
        "update package version {} authenticated (trusted {trusted})",
        m.version
    );
    Ok(())
}
