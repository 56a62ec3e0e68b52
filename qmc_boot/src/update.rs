// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Update path: manifest selection, media to staging, installation

use crate::{config::BootConfig, flash::Nor, Error};
use log::{debug as okay, info, trace, warn};
use qmc_areas::{align_up, Extent, UpdateManifest, HEADER_BLOCK_SIZE, PAGE_SIZE, SECTOR_SIZE};

/// Removable storage holding update and decommission files
pub trait RemovableMedia {
    fn is_inserted(&mut self) -> bool;
    fn exists(&mut self, path: &str) -> Result<bool, Error>;
    fn len(&mut self, path: &str) -> Result<u64, Error>;

    /// Reads at `offset`, returning the number of bytes read
    fn read_at(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, Error>;

    fn delete(&mut self, path: &str) -> Result<(), Error>;
}

/// Where the update to apply comes from
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    Nothing,
    /// A candidate that does not advance the trusted version was discarded
    Stale { version: u32, trusted: u32 },
    Staged(UpdateManifest),
    Media(UpdateManifest),
}

fn read_exact(
    media: &mut dyn RemovableMedia,
    path: &str,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), Error> {
    let mut done = 0;
    while done < buf.len() {
        let n = media.read_at(path, offset + done as u64, &mut buf[done..])?;
        if n == 0 {
            return Err(Error::Media("unexpected end of file"));
        }
        done += n;
    }
    Ok(())
}

fn staged_manifest(flash: &mut Nor, staging: Extent) -> Result<Option<UpdateManifest>, Error> {
    let block = flash.read_vec(staging.start, HEADER_BLOCK_SIZE)?;
    if !UpdateManifest::is_tagged(&block) {
        return Ok(None);
    }
    Ok(Some(UpdateManifest::parse(&block)?))
}

/// Picks the newest update candidate and discards stale ones
pub fn select(
    flash: &mut Nor,
    media: &mut dyn RemovableMedia,
    cfg: &BootConfig,
    trusted: u32,
) -> Result<Selection, Error> {
    let staging = cfg.memory.staging;
    let path = cfg.update_file.as_str();
    let staged = staged_manifest(flash, staging)?;

    let mut on_media = None;
    if media.is_inserted() && media.exists(path)? {
        let mut block = [0u8; HEADER_BLOCK_SIZE];
        read_exact(media, path, 0, &mut block)?;
        if !UpdateManifest::is_tagged(&block) {
            warn!("{path} is not an update package, deleting");
            media.delete(path)?;
        } else {
            let m = UpdateManifest::parse(&block)?;
            match staged {
                Some(s) if s.version >= m.version => {
                    trace!(
                        "staged version {} supersedes {path} version {}",
                        s.version,
                        m.version
                    );
                    media.delete(path)?;
                }
                _ => on_media = Some(m),
            }
        }
    }

    let selection = match (on_media, staged) {
        (Some(m), _) => Selection::Media(m),
        (None, Some(s)) => Selection::Staged(s),
        (None, None) => return Ok(Selection::Nothing),
    };
    let version = match selection {
        Selection::Media(m) | Selection::Staged(m) => m.version,
        _ => return Ok(selection),
    };
    if version <= trusted {
        warn!("update version {version} does not exceed trusted {trusted}, discarding");
        if media.is_inserted() && media.exists(path)? {
            media.delete(path)?;
        }
        if staged.is_some() {
            flash.erase(staging.start, SECTOR_SIZE)?;
        }
        return Ok(Selection::Stale { version, trusted });
    }
    info!("selected update version {version}");
    Ok(selection)
}

/// Copies the update file into the staging region, manifest block last,
/// and returns the manifest as read back from staging
pub fn media_to_staging(
    flash: &mut Nor,
    media: &mut dyn RemovableMedia,
    cfg: &BootConfig,
) -> Result<UpdateManifest, Error> {
    let staging = cfg.memory.staging;
    let path = cfg.update_file.as_str();
    let len = media.len(path)?;
    if len < HEADER_BLOCK_SIZE as u64 || len > u64::from(staging.len) {
        return Err(Error::TooLarge {
            what: "update file",
            len,
            max: u64::from(staging.len),
        });
    }
    let len = len as u32;
    flash.erase(staging.start, len)?;

    let mut page = [0u8; PAGE_SIZE as usize];
    let mut offset = HEADER_BLOCK_SIZE as u32;
    while offset < len {
        let n = (len - offset).min(PAGE_SIZE) as usize;
        read_exact(media, path, u64::from(offset), &mut page[..n])?;
        flash.program(staging.start + offset, &page[..n])?;
        offset += n as u32;
    }
    let mut block = [0u8; HEADER_BLOCK_SIZE];
    read_exact(media, path, 0, &mut block)?;
    flash.program(staging.start, &block)?;
    flash.compare(staging.start, &block)?;
    media.delete(path)?;

    let m = staged_manifest(flash, staging)?.ok_or(Error::Media("staged manifest lost"))?;
    okay!("{path} staged ({len:#x} bytes)");
    Ok(m)
}

/// Copies the packaged image from staging into the main slot
pub fn install(flash: &mut Nor, m: &UpdateManifest, main: Extent) -> Result<(), Error> {
    let image = m.image_extent();
    let len = align_up(image.len, PAGE_SIZE).ok_or(Error::TooLarge {
        what: "packaged image",
        len: u64::from(image.len),
        max: u64::from(main.len),
    })?;
    if len > main.len {
        return Err(Error::TooLarge {
            what: "packaged image",
            len: u64::from(len),
            max: u64::from(main.len),
        });
    }
    flash.erase(main.start, len)?;
    flash.copy_programmed(image.start, main.start, image.len)?;
    flash.compare_ranges(image.start, main.start, image.len)?;
    okay!("update version {} installed ({:#x} bytes)", m.version, image.len);
    Ok(())
}

/// Erases the whole staging region
pub fn clear_staging(flash: &mut Nor, staging: Extent) -> Result<(), Error> {
    flash.erase_extent(staging)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{MemFlash, MemMedia};

    fn package(version: u32, staging: Extent, body: usize) -> Vec<u8> {
        let m = UpdateManifest {
            version,
            fw_data_addr: staging.start + HEADER_BLOCK_SIZE as u32,
            fw_data_length: body as u32,
            fwu_data_addr: staging.start,
            fwu_data_length: (HEADER_BLOCK_SIZE + body) as u32,
            sign_data_addr: staging.start + (HEADER_BLOCK_SIZE + body) as u32,
        };
        let mut v = m.to_block().to_vec();
        v.extend((0..body).map(|i| i as u8));
        v
    }

    #[test]
    fn media_candidate_is_staged() {
        let cfg = BootConfig::default();
        let mut dev = MemFlash::new(&cfg.memory);
        let mut nor = Nor::new(&mut dev, 1);
        let mut media = MemMedia::inserted();
        let file = package(4, cfg.memory.staging, 0x333);
        media.put(&cfg.update_file, file.clone());

        let sel = select(&mut nor, &mut media, &cfg, 3).unwrap();
        assert!(matches!(sel, Selection::Media(m) if m.version == 4));
        let m = media_to_staging(&mut nor, &mut media, &cfg).unwrap();
        assert_eq!(m.version, 4);
        assert!(!media.exists(&cfg.update_file).unwrap());
        nor.compare(cfg.memory.staging.start, &file).unwrap();
    }

    #[test]
    fn staged_newer_wins_and_file_is_deleted() {
        let cfg = BootConfig::default();
        let mut dev = MemFlash::new(&cfg.memory);
        let mut nor = Nor::new(&mut dev, 1);
        nor.write(cfg.memory.staging.start, &package(6, cfg.memory.staging, 16))
            .unwrap();
        let mut media = MemMedia::inserted();
        media.put(&cfg.update_file, package(5, cfg.memory.staging, 16));

        let sel = select(&mut nor, &mut media, &cfg, 3).unwrap();
        assert!(matches!(sel, Selection::Staged(m) if m.version == 6));
        assert!(!media.exists(&cfg.update_file).unwrap());
    }

    #[test]
    fn untagged_file_is_deleted() {
        let cfg = BootConfig::default();
        let mut dev = MemFlash::new(&cfg.memory);
        let mut nor = Nor::new(&mut dev, 1);
        let mut media = MemMedia::inserted();
        media.put(&cfg.update_file, vec![0u8; 512]);
        assert_eq!(select(&mut nor, &mut media, &cfg, 0).unwrap(), Selection::Nothing);
        assert!(!media.exists(&cfg.update_file).unwrap());
    }

    #[test]
    fn stale_candidates_are_discarded() {
        let cfg = BootConfig::default();
        let mut dev = MemFlash::new(&cfg.memory);
        let mut nor = Nor::new(&mut dev, 1);
        nor.write(cfg.memory.staging.start, &package(3, cfg.memory.staging, 16))
            .unwrap();
        let mut media = MemMedia::inserted();
        assert_eq!(
            select(&mut nor, &mut media, &cfg, 3).unwrap(),
            Selection::Stale {
                version: 3,
                trusted: 3
            }
        );
        // Nothing left to select on the next boot
        assert_eq!(select(&mut nor, &mut media, &cfg, 3).unwrap(), Selection::Nothing);
    }

    #[test]
    fn oversized_file_is_refused() {
        let mut cfg = BootConfig::default();
        cfg.memory.staging = Extent::new(cfg.memory.staging.start, 0x1000);
        let mut dev = MemFlash::new(&cfg.memory);
        let mut nor = Nor::new(&mut dev, 1);
        let mut media = MemMedia::inserted();
        media.put(&cfg.update_file, package(9, cfg.memory.staging, 0x1000));
        assert!(matches!(
            media_to_staging(&mut nor, &mut media, &cfg),
            Err(Error::TooLarge { .. })
        ));
    }

    #[test]
    fn install_copies_image() {
        let cfg = BootConfig::default();
        let mut dev = MemFlash::new(&cfg.memory);
        let mut nor = Nor::new(&mut dev, 1);
        let pkg = package(2, cfg.memory.staging, 0x456);
        nor.write(cfg.memory.staging.start, &pkg).unwrap();
        let m = UpdateManifest::parse(&pkg).unwrap();
        install(&mut nor, &m, cfg.memory.main_fw).unwrap();
        nor.compare(cfg.memory.main_fw.start, &pkg[HEADER_BLOCK_SIZE..])
            .unwrap();
    }
}
