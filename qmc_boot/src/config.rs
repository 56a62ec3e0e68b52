// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{keys::ChannelKeys, Error};
use qmc_areas::MemoryMap;
use serde::Deserialize;

/// The GlobalPlatform default key, used by every factory-fresh secure element
pub const FACTORY_KEY: [u8; 16] = [
    0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4A, 0x4B, 0x4C, 0x4D, 0x4E, 0x4F,
];

/// Tunables of the boot path
///
/// Every field has a default, so an empty TOML document is a valid
/// configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct BootConfig {
    pub memory: MemoryMap,

    /// Attempt budget for each flash erase, program or read
    pub flash_attempts: u32,

    /// Attempt budget for secure element reads, channel opens and the RNG
    pub se_attempts: u32,

    pub secwd_poll_attempts: u32,
    pub secwd_poll_interval_ms: u32,
    pub secwd_release_delay_ms: u32,

    pub update_file: String,
    pub decommission_file: String,

    /// Whether the application receives the secure channel keys
    pub hand_off_channel_keys: bool,

    /// Hex-encoded key used for all three factory channel keys
    pub factory_channel_key: String,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            memory: MemoryMap::default(),
            flash_attempts: 3,
            se_attempts: 3,
            secwd_poll_attempts: 10,
            secwd_poll_interval_ms: 10,
            secwd_release_delay_ms: 20,
            update_file: "/qmc2/fw_update.bin".to_string(),
            decommission_file: "/qmc2/decommission.bin".to_string(),
            hand_off_channel_keys: true,
            factory_channel_key: hex::encode_upper(FACTORY_KEY),
        }
    }
}

impl BootConfig {
    pub fn from_toml(s: &str) -> Result<Self, Error> {
        let cfg: BootConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.memory.validate().map_err(Error::MemoryMap)?;
        if self.flash_attempts == 0 || self.se_attempts == 0 || self.secwd_poll_attempts == 0 {
            return Err(Error::BadConfig("attempt budgets must be at least 1"));
        }
        self.factory_keys()?;
        Ok(())
    }

    pub fn factory_keys(&self) -> Result<ChannelKeys, Error> {
        let key: [u8; 16] = hex::decode(&self.factory_channel_key)?
            .try_into()
            .map_err(|_| Error::BadConfig("factory channel key must be 16 bytes"))?;
        Ok(ChannelKeys {
            enc: key,
            mac: key,
            dek: key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmc_areas::{Extent, LayoutError, Region};

    #[test]
    fn empty_document_is_default() {
        assert_eq!(BootConfig::from_toml("").unwrap(), BootConfig::default());
    }

    #[test]
    fn overrides() {
        let cfg = BootConfig::from_toml(
            r#"
            se-attempts = 5
            secwd-poll-attempts = 2
            hand-off-channel-keys = false

            [memory]
            staging = { start = 0x34000000, len = 0x100000 }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.se_attempts, 5);
        assert_eq!(cfg.secwd_poll_attempts, 2);
        assert!(!cfg.hand_off_channel_keys);
        assert_eq!(cfg.memory.staging, Extent::new(0x3400_0000, 0x10_0000));
        assert_eq!(cfg.memory.main_fw, MemoryMap::default().main_fw);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            BootConfig::from_toml("flash-retries = 2"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn zero_budget_is_rejected() {
        assert!(matches!(
            BootConfig::from_toml("flash-attempts = 0"),
            Err(Error::BadConfig(_))
        ));
    }

    #[test]
    fn overlapping_memory_map_is_rejected() {
        let err = BootConfig::from_toml(
            r#"
            [memory]
            cfg-backup = { start = 0x6103F000, len = 0x2000 }
            "#,
        )
        .unwrap_err();
        assert!(
            matches!(
                err,
                Error::MemoryMap(LayoutError::Overlap(Region::Recovery, Region::CfgBackup))
            ),
            "{err}"
        );
    }

    #[test]
    fn factory_key() {
        let keys = BootConfig::default().factory_keys().unwrap();
        assert_eq!(keys.enc, FACTORY_KEY);
        assert_eq!(keys.dek, FACTORY_KEY);
        let bad = BootConfig {
            factory_channel_key: "4041".to_string(),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
