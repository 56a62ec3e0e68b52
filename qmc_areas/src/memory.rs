// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::LayoutError;
use serde::{Deserialize, Serialize};

/// External flash erase granule
pub const SECTOR_SIZE: u32 = 0x1000;

/// External flash program granule
pub const PAGE_SIZE: u32 = 0x100;

/// Rounds `len` up to a multiple of `to`, which must be a power of two
pub fn align_up(len: u32, to: u32) -> Option<u32> {
    debug_assert!(to.is_power_of_two());
    len.checked_add(to - 1).map(|v| v & !(to - 1))
}

/// A half-open address range `[start, start + len)`
///
/// All containment checks widen to `u64` so that a range ending exactly at
/// the top of the address space is representable and wrap-around can never
/// make an outside range look inside.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Extent {
    pub start: u32,
    pub len: u32,
}

impl Extent {
    pub const fn new(start: u32, len: u32) -> Self {
        Self { start, len }
    }

    pub fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && u64::from(addr) < self.end()
    }

    /// Returns true if `[start, start + len)` lies entirely inside
    pub fn contains_range(&self, start: u32, len: u64) -> bool {
        start >= self.start && u64::from(start) + len <= self.end()
    }

    pub fn contains_extent(&self, other: &Extent) -> bool {
        self.contains_range(other.start, u64::from(other.len))
    }

    pub fn overlaps(&self, other: &Extent) -> bool {
        u64::from(self.start) < other.end() && u64::from(other.start) < self.end()
    }
}

impl std::fmt::Display for Extent {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[{:#010x}, {:#010x})", self.start, self.end())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Region {
    MainFw,
    Recovery,
    CfgBackup,
    CfgData,
    EventLog,
    Staging,
    KeyStore,
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Region::MainFw => "main-fw",
            Region::Recovery => "recovery",
            Region::CfgBackup => "cfg-backup",
            Region::CfgData => "cfg-data",
            Region::EventLog => "event-log",
            Region::Staging => "staging",
            Region::KeyStore => "key-store",
        };
        f.write_str(s)
    }
}

/// Placement of every flash region touched during boot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct MemoryMap {
    pub main_fw: Extent,
    pub recovery: Extent,
    pub cfg_backup: Extent,
    pub cfg_data: Extent,
    pub event_log: Extent,
    pub staging: Extent,
    pub key_store: Extent,
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self {
            main_fw: Extent::new(0x6008_0000, 0x00FB_F000),
            recovery: Extent::new(0x6103_F000, 0x00FB_F000),
            cfg_backup: Extent::new(0x61FF_E000, 0x2000),
            cfg_data: Extent::new(0x3000_0000, 0x2000),
            event_log: Extent::new(0x3000_2000, 0x0303_E000),
            staging: Extent::new(0x3304_0000, 0x00FC_0000),
            key_store: Extent::new(0x6007_9000, 0x1000),
        }
    }
}

impl MemoryMap {
    pub fn region(&self, region: Region) -> Extent {
        match region {
            Region::MainFw => self.main_fw,
            Region::Recovery => self.recovery,
            Region::CfgBackup => self.cfg_backup,
            Region::CfgData => self.cfg_data,
            Region::EventLog => self.event_log,
            Region::Staging => self.staging,
            Region::KeyStore => self.key_store,
        }
    }

    pub fn regions(&self) -> [(Region, Extent); 7] {
        [
            Region::MainFw,
            Region::Recovery,
            Region::CfgBackup,
            Region::CfgData,
            Region::EventLog,
            Region::Staging,
            Region::KeyStore,
        ]
        .map(|r| (r, self.region(r)))
    }

    /// Finds the region holding `addr`, if any
    pub fn find(&self, addr: u32) -> Option<Region> {
        self.regions()
            .into_iter()
            .find(|(_, e)| e.contains(addr))
            .map(|(r, _)| r)
    }

    /// Checks that every region is sector aligned and that no two overlap
    pub fn validate(&self) -> Result<(), LayoutError> {
        let regions = self.regions();
        for (r, e) in &regions {
            if e.start % SECTOR_SIZE != 0 || e.len % SECTOR_SIZE != 0 || e.is_empty() {
                return Err(LayoutError::Misaligned(*r));
            }
        }
        for (i, (a, ea)) in regions.iter().enumerate() {
            for (b, eb) in &regions[i + 1..] {
                if ea.overlaps(eb) {
                    return Err(LayoutError::Overlap(*a, *b));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_map_is_valid() {
        MemoryMap::default().validate().unwrap();
    }

    #[test]
    fn containment_is_boundary_exact() {
        let e = Extent::new(0x1000, 0x100);
        assert!(e.contains(0x1000));
        assert!(e.contains(0x10FF));
        assert!(!e.contains(0x1100));
        assert!(!e.contains(0x0FFF));
        assert!(e.contains_range(0x1000, 0x100));
        assert!(!e.contains_range(0x1000, 0x101));
        assert!(e.contains_range(0x1100, 0));
    }

    #[test]
    fn containment_does_not_wrap() {
        let top = Extent::new(0xFFFF_F000, 0x1000);
        assert_eq!(top.end(), 0x1_0000_0000);
        assert!(top.contains(0xFFFF_FFFF));
        assert!(!top.contains_range(0xFFFF_FFF0, 0x20));
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let mut map = MemoryMap::default();
        map.cfg_backup = Extent::new(map.recovery.start, SECTOR_SIZE);
        assert!(matches!(
            map.validate(),
            Err(LayoutError::Overlap(Region::Recovery, Region::CfgBackup))
        ));
    }

    #[test]
    fn align() {
        assert_eq!(align_up(0, PAGE_SIZE), Some(0));
        assert_eq!(align_up(1, PAGE_SIZE), Some(0x100));
        assert_eq!(align_up(0x100, PAGE_SIZE), Some(0x100));
        assert_eq!(align_up(u32::MAX, PAGE_SIZE), None);
    }

    #[test]
    fn find_region() {
        let map = MemoryMap::default();
        assert_eq!(map.find(0x6008_0000), Some(Region::MainFw));
        assert_eq!(map.find(0x6008_0000 + 0x00FB_F000), Some(Region::Recovery));
        assert_eq!(map.find(0x1000), None);
    }
}
