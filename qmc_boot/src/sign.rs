// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side image and package tooling
//!
//! Signatures are RSA PKCS#1 v1.5 over the SHA-512 digest of the signed
//! extent, framed as a DER SEQUENCE holding one OCTET STRING.

use crate::Error;
use der::{asn1::OctetStringRef, Decode as _, Encode as _, Sequence};
use qmc_areas::{align_up, Extent, FirmwareHeader, UpdateManifest, HEADER_BLOCK_SIZE, PAGE_SIZE};
use rsa::{
    pkcs1v15::Pkcs1v15Sign,
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    RsaPrivateKey, RsaPublicKey,
};
use secwd_token::CORE1_RAM_BASE;
use sha2::{Digest as _, Sha512};

/// The secure element's signature framing: a SEQUENCE holding the raw
/// signature as its only OCTET STRING
#[derive(Copy, Clone, Debug, Eq, PartialEq, Sequence)]
pub struct FramedSignature<'a> {
    pub signature: OctetStringRef<'a>,
}

/// Frames a raw signature the way the secure element expects it
pub fn der_wrap(sig: &[u8]) -> Result<Vec<u8>, Error> {
    let framed = FramedSignature {
        signature: OctetStringRef::new(sig)?,
    };
    Ok(framed.to_der()?)
}

/// Extracts the raw signature from its DER framing
pub fn der_unwrap(blob: &[u8]) -> Option<&[u8]> {
    FramedSignature::from_der(blob)
        .ok()
        .map(|f| f.signature.as_bytes())
}

pub fn load_private_key(pem: &str) -> Result<RsaPrivateKey, Error> {
    Ok(RsaPrivateKey::from_pkcs8_pem(pem)?)
}

pub fn load_public_key(pem: &str) -> Result<RsaPublicKey, Error> {
    Ok(RsaPublicKey::from_public_key_pem(pem)?)
}

/// Signs `data` and returns the framed signature
pub fn sign_extent(data: &[u8], key: &RsaPrivateKey) -> Result<Vec<u8>, Error> {
    let digest = Sha512::digest(data);
    let sig = key
        .sign(Pkcs1v15Sign::new::<Sha512>(), digest.as_slice())
        .map_err(Error::SigningError)?;
    der_wrap(&sig)
}

/// Checks a framed signature over a precomputed digest
pub fn verify_digest(key: &RsaPublicKey, digest: &[u8], blob: &[u8]) -> bool {
    match der_unwrap(blob) {
        Some(sig) => key
            .verify(Pkcs1v15Sign::new::<Sha512>(), digest, sig)
            .is_ok(),
        None => false,
    }
}

/// Checks a framed signature over `data`
pub fn verify_extent(key: &RsaPublicKey, data: &[u8], blob: &[u8]) -> bool {
    verify_digest(key, &Sha512::digest(data), blob)
}

/// Inputs of a firmware image
#[derive(Clone, Debug)]
pub struct ImageSpec {
    pub version: u32,
    /// Slot the image is linked for
    pub base: u32,
    pub stack_pointer: u32,
    /// Primary code, placed right after the vector table
    pub code: Vec<u8>,
    /// Secondary-core image
    pub secondary: Vec<u8>,
    pub secondary_boot_addr: u32,
    pub cfg: Extent,
}

impl ImageSpec {
    pub fn new(version: u32, base: u32) -> Self {
        Self {
            version,
            base,
            stack_pointer: 0x2000_8000,
            code: vec![0x00, 0xBF, 0xFE, 0xE7],
            secondary: vec![0xA5; 0x40],
            secondary_boot_addr: CORE1_RAM_BASE,
            cfg: Extent::default(),
        }
    }

    /// Lays out `[header | vector table | code | secondary]`
    ///
    /// The header describes the layout; the signature address is the end of
    /// the extent.
    pub fn layout(&self) -> (FirmwareHeader, Vec<u8>) {
        let vtor_offset = HEADER_BLOCK_SIZE as u32;
        let code_offset = vtor_offset + 8;
        let mut body = Vec::new();
        body.extend(self.stack_pointer.to_le_bytes());
        body.extend(((self.base + code_offset) | 1).to_le_bytes());
        body.extend(&self.code);

        let cm4_offset = align_up(code_offset + self.code.len() as u32, PAGE_SIZE)
            .unwrap_or(code_offset);
        body.resize((cm4_offset - vtor_offset) as usize, 0xFF);
        body.extend(&self.secondary);

        let length = vtor_offset + body.len() as u32;
        let hdr = FirmwareHeader {
            version: self.version,
            fw_data_addr: self.base,
            fw_data_length: length,
            sign_data_addr: self.base + length,
            cm4_fw_data_addr: self.base + cm4_offset,
            cm4_fw_data_length: self.secondary.len() as u32,
            cm4_boot_addr: self.secondary_boot_addr,
            cm7_vector_table_addr: self.base + vtor_offset,
            cfg_data_addr: self.cfg.start,
            cfg_data_length: self.cfg.len,
        };
        (hdr, body)
    }
}

/// Builds a signed image from a header and the bytes following it
///
/// The header is taken as given, so a deliberately malformed layout is
/// still correctly signed.
pub fn seal(hdr: &FirmwareHeader, body: &[u8], key: &RsaPrivateKey) -> Result<Vec<u8>, Error> {
    let mut image = hdr.to_block().to_vec();
    image.extend_from_slice(body);
    let len = hdr.fw_data_length as usize;
    if image.len() < len {
        image.resize(len, 0xFF);
    }
    let sig = sign_extent(&image[..len], key)?;
    let sig_offset = hdr
        .sign_data_addr
        .checked_sub(hdr.fw_data_addr)
        .ok_or(Error::ExtentViolation {
            what: "signature address",
            addr: hdr.sign_data_addr,
        })? as usize;
    image.truncate(len);
    image.resize(sig_offset, 0xFF);
    image.extend(sig);
    Ok(image)
}

pub fn sign_image(spec: &ImageSpec, key: &RsaPrivateKey) -> Result<Vec<u8>, Error> {
    let (hdr, body) = spec.layout();
    seal(&hdr, &body, key)
}

/// Wraps a signed image into an update package for `staging`
pub fn build_package(
    image: &[u8],
    version: u32,
    staging: Extent,
    key: &RsaPrivateKey,
) -> Result<Vec<u8>, Error> {
    let base = staging.start;
    let extent_len = HEADER_BLOCK_SIZE + image.len();
    let m = UpdateManifest {
        version,
        fw_data_addr: base + HEADER_BLOCK_SIZE as u32,
        fw_data_length: image.len() as u32,
        fwu_data_addr: base,
        fwu_data_length: extent_len as u32,
        sign_data_addr: base + extent_len as u32,
    };
    let mut pkg = m.to_block().to_vec();
    pkg.extend_from_slice(image);
    let sig = sign_extent(&pkg, key)?;
    pkg.extend(sig);
    Ok(pkg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::signature_len;

    const FW_KEY: &str = include_str!("../tests/data/fw_key.pem");
    const FW_PUB: &str = include_str!("../tests/data/fw_pub.pem");

    #[test]
    fn framing() {
        let blob = der_wrap(&[0x55; 256]).unwrap();
        assert_eq!(&blob[..8], &[0x30, 0x82, 0x01, 0x04, 0x04, 0x82, 0x01, 0x00]);
        assert_eq!(blob.len(), 264);
        assert_eq!(signature_len(&blob).unwrap(), 264);
        assert_eq!(der_unwrap(&blob), Some(&[0x55; 256][..]));
        assert_eq!(der_unwrap(&blob[..100]), None);
        assert_eq!(der_unwrap(&[0x04, 0x01, 0x00]), None);
        // Trailing bytes after the frame are not part of it
        let mut padded = blob.clone();
        padded.push(0xFF);
        assert_eq!(der_unwrap(&padded), None);
    }

    #[test]
    fn long_signatures_keep_their_length() {
        // Lengths past 0xFFFF need the three-byte form
        let blob = der_wrap(&vec![0xA5; 0x1_0000]).unwrap();
        assert_eq!(&blob[..2], &[0x30, 0x83]);
        assert_eq!(&blob[5..7], &[0x04, 0x83]);
        assert_eq!(der_unwrap(&blob).map(<[u8]>::len), Some(0x1_0000));
        assert!(matches!(signature_len(&blob), Err(Error::SignatureMalformed(_))));
    }

    #[test]
    fn signed_image() {
        let key = load_private_key(FW_KEY).unwrap();
        let public = load_public_key(FW_PUB).unwrap();
        let spec = ImageSpec::new(5, 0x6008_0000);
        let image = sign_image(&spec, &key).unwrap();
        let hdr = FirmwareHeader::parse(&image).unwrap();
        assert_eq!(hdr.version, 5);
        assert_eq!(hdr.cm7_vector_table_addr, 0x6008_0100);
        assert_eq!(hdr.cm4_fw_data_addr, 0x6008_0200);
        assert_eq!(hdr.fw_data_length, 0x240);
        let len = hdr.fw_data_length as usize;
        assert_eq!(&image[0x104..0x108], &0x6008_0109u32.to_le_bytes());
        let digest = Sha512::digest(&image[..len]);
        assert!(verify_digest(&public, &digest, &image[len..]));
        let mut tampered = image.clone();
        tampered[0x110] ^= 1;
        assert!(!verify_extent(&public, &tampered[..len], &image[len..]));
    }

    #[test]
    fn package_layout() {
        let key = load_private_key(FW_KEY).unwrap();
        let staging = Extent::new(0x3304_0000, 0x10_0000);
        let pkg = build_package(&[0xEE; 0x300], 9, staging, &key).unwrap();
        let m = UpdateManifest::parse(&pkg).unwrap();
        assert_eq!(m.version, 9);
        assert_eq!(m.fw_data_addr, 0x3304_0100);
        assert_eq!(m.sign_data_addr, 0x3304_0400);
        assert_eq!(pkg.len(), 0x400 + 264);
    }
}
