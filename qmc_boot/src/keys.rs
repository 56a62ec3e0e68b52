// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key & session manager
//!
//! Session keys are never stored in the clear.  The key store in flash holds
//! key codes produced by the hardware-bound key-wrapping unit; every boot
//! unwraps them into a [`SessionKeySet`] that lives only until hand-off.

use crate::{
    config::BootConfig,
    flash::Nor,
    persist::StateStore,
    se::{PolicySession, SecureElement, Session, AES_POLICY_KEY},
    secwd::Soc,
    Error,
};
use log::{debug as okay, info, trace};
use qmc_areas::{
    keystore::{key_code_size, KeyStore},
    Extent, KeySlot,
};
use secwd_token::{CHANNEL_KEYS_ADDR, LOG_KEYS_ADDR};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};
use zerocopy::AsBytes;

/// Hardware-bound key derivation and wrapping unit
pub trait KeyWrapUnit {
    /// Generates a fresh random key of `len` bytes and returns its key code
    fn generate(&mut self, slot: KeySlot, len: usize) -> Result<Vec<u8>, Error>;

    /// Wraps a caller-supplied key
    fn wrap(&mut self, slot: KeySlot, key: &[u8]) -> Result<Vec<u8>, Error>;

    fn unwrap(&mut self, slot: KeySlot, code: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error>;
}

/// Secure channel keys: encryption, integrity and key-encryption
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ChannelKeys {
    pub enc: [u8; 16],
    pub mac: [u8; 16],
    pub dek: [u8; 16],
}

impl ChannelKeys {
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new([self.enc, self.mac, self.dek].concat())
    }
}

impl std::fmt::Debug for ChannelKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("ChannelKeys(..)")
    }
}

/// Policy authorization key
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PolicyKey(pub [u8; 16]);

impl std::fmt::Debug for PolicyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("PolicyKey(..)")
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct LogKeys {
    pub config_key: [u8; 32],
    pub config_nonce: [u8; 16],
    pub key: [u8; 32],
    pub nonce: [u8; 16],
}

impl LogKeys {
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(
            [
                &self.config_key[..],
                &self.config_nonce[..],
                &self.key[..],
                &self.nonce[..],
            ]
            .concat(),
        )
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeySet {
    pub channel: ChannelKeys,
    pub policy: PolicyKey,
    pub log: LogKeys,
}

fn fixed<const N: usize>(key: &[u8]) -> Result<[u8; N], Error> {
    key.try_into()
        .map_err(|_| Error::KeyReconstruction("unwrapped key has the wrong length"))
}

fn read_store(flash: &mut Nor, at: Extent) -> Result<Zeroizing<Vec<u8>>, Error> {
    Ok(Zeroizing::new(flash.read_vec(at.start, KeyStore::SIZE)?))
}

/// Returns true if the key store sector has never been programmed
pub fn key_store_blank(flash: &mut Nor, at: Extent) -> Result<bool, Error> {
    let mut word = [0u8; 4];
    flash.read(at.start, &mut word)?;
    Ok(KeyStore::is_blank(&word))
}

/// Unwraps every key code of the store
pub fn reconstruct_keys(
    flash: &mut Nor,
    puf: &mut dyn KeyWrapUnit,
    at: Extent,
) -> Result<SessionKeySet, Error> {
    let raw = read_store(flash, at)?;
    if KeyStore::is_blank(&raw) {
        return Err(Error::KeyReconstruction("key store is blank"));
    }
    let store = KeyStore::parse(&raw)?;
    let mut open = |slot: KeySlot| -> Result<Zeroizing<Vec<u8>>, Error> {
        let key = puf.unwrap(slot, store.code(slot))?;
        if key.len() != slot.key_len() {
            return Err(Error::KeyReconstruction("unwrapped key has the wrong length"));
        }
        Ok(key)
    };
    let keys = SessionKeySet {
        channel: ChannelKeys {
            enc: fixed(&open(KeySlot::Enc)?)?,
            mac: fixed(&open(KeySlot::Mac)?)?,
            dek: fixed(&open(KeySlot::Dek)?)?,
        },
        policy: PolicyKey(fixed(&open(KeySlot::Policy)?)?),
        log: LogKeys {
            config_key: fixed(&open(KeySlot::LogConfigKey)?)?,
            config_nonce: fixed(&open(KeySlot::LogConfigNonce)?)?,
            key: fixed(&open(KeySlot::LogKey)?)?,
            nonce: fixed(&open(KeySlot::LogNonce)?)?,
        },
    };
    okay!("session keys reconstructed");
    Ok(keys)
}

/// Opens the authenticated channel and the policy session
///
/// Sets the encrypted-traffic mandate if the secure element reports it
/// unset.
pub fn check_channel<'s>(
    se: &'s mut dyn SecureElement,
    keys: &SessionKeySet,
    attempts: u32,
) -> Result<PolicySession<'s>, Error> {
    let session = Session::open(se, &keys.channel, attempts)?;
    let mut policy = session.open_policy(&keys.policy)?;
    policy.ensure_mandate()?;
    okay!("secure channel and policy session established");
    Ok(policy)
}

/// First-boot provisioning
///
/// Runs only while the key store is blank.  Any failure before the key
/// store is programmed leaves the device in its factory state, so the whole
/// sequence is repeated on the next boot.
pub fn provision(
    flash: &mut Nor,
    se: &mut dyn SecureElement,
    puf: &mut dyn KeyWrapUnit,
    state: &mut StateStore,
    cfg: &BootConfig,
) -> Result<(), Error> {
    let at = cfg.memory.key_store;
    info!("key store is blank, provisioning");
    let factory = cfg.factory_keys()?;

    // The policy key object only exists on a commissioned device
    let policy = {
        let mut s = Session::open(se, &factory, cfg.se_attempts)?;
        let raw = Zeroizing::new(
            s.read_object(AES_POLICY_KEY)
                .map_err(|_| Error::NotCommissioned)?,
        );
        PolicyKey(fixed(&raw).map_err(|_| Error::NotCommissioned)?)
    };

    let mut store = KeyStore::new();
    for slot in KeySlot::ALL {
        let code = match slot {
            KeySlot::Policy => puf.wrap(slot, &policy.0)?,
            _ => puf.generate(slot, slot.key_len())?,
        };
        if code.len() != key_code_size(slot.key_len()) {
            return Err(Error::KeyReconstruction("key code has the wrong length"));
        }
        store.set_code(slot, &code)?;
    }
    flash.erase_extent(at)?;
    flash.program(at.start, store.as_bytes())?;
    flash.compare(at.start, store.as_bytes())?;
    trace!("key store programmed at {at}");

    let keys = reconstruct_keys(flash, puf, at)?;
    if keys.policy != policy {
        return Err(Error::KeyReconstruction("policy key does not survive wrapping"));
    }

    {
        let mut s = Session::open(se, &factory, cfg.se_attempts)?;
        s.device().erase_object(AES_POLICY_KEY)?;
        s.device().rotate_channel_keys(&keys.channel)?;
    }
    {
        let mut s = Session::open(se, &keys.channel, cfg.se_attempts)?;
        s.ensure_mandate()?;
    }
    state.init()?;
    okay!("first-boot provisioning complete");
    Ok(())
}

fn hand_off(soc: &mut dyn Soc, addr: u32, bytes: &[u8]) -> Result<(), Error> {
    soc.ram_write(addr, bytes)?;
    let mut back = Zeroizing::new(vec![0u8; bytes.len()]);
    soc.ram_read(addr, &mut back)?;
    if back.as_slice() != bytes {
        return Err(Error::Compare { addr });
    }
    Ok(())
}

/// Places the log keys where the application expects them
pub fn hand_off_log_keys(soc: &mut dyn Soc, keys: &LogKeys) -> Result<(), Error> {
    hand_off(soc, LOG_KEYS_ADDR, &keys.to_bytes())?;
    okay!("log keys handed off");
    Ok(())
}

/// Places the channel keys where the application expects them
///
/// The policy key is never handed off.
pub fn hand_off_channel_keys(soc: &mut dyn Soc, keys: &ChannelKeys) -> Result<(), Error> {
    hand_off(soc, CHANNEL_KEYS_ADDR, &keys.to_bytes())?;
    okay!("channel keys handed off");
    Ok(())
}

/// Size of each key hand-off area
pub const LOG_KEYS_LEN: usize = 32 + 16 + 32 + 16;
pub const CHANNEL_KEYS_LEN: usize = 3 * 16;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        se::AES_AUTH_OBJ,
        sim::{MemFlash, SimGpr, SimPuf, SimSecureElement, SimSoc},
    };

    const POLICY: [u8; 16] = [0x5A; 16];

    fn provisioned(cfg: &BootConfig) -> (MemFlash, SimSecureElement, SimPuf, SimGpr) {
        let mut flash = MemFlash::new(&cfg.memory);
        let mut se = SimSecureElement::new(3);
        se.commission(PolicyKey(POLICY));
        let mut puf = SimPuf::new([9; 32], 4);
        let mut gpr = SimGpr {
            regs: [0xAA; 4],
            ..Default::default()
        };
        {
            let mut nor = Nor::new(&mut flash, 1);
            let mut state = StateStore::new(&mut gpr);
            provision(&mut nor, &mut se, &mut puf, &mut state, cfg).unwrap();
        }
        (flash, se, puf, gpr)
    }

    #[test]
    fn first_boot_provisioning() {
        let cfg = BootConfig::default();
        let (mut flash, mut se, mut puf, gpr) = provisioned(&cfg);
        assert_eq!(gpr.regs, [0; 4]);
        assert!(se.mandated());
        assert!(!se.has_object(AES_POLICY_KEY));
        assert!(se.has_object(AES_AUTH_OBJ));

        let mut nor = Nor::new(&mut flash, 1);
        assert!(!key_store_blank(&mut nor, cfg.memory.key_store).unwrap());
        let keys = reconstruct_keys(&mut nor, &mut puf, cfg.memory.key_store).unwrap();
        assert_eq!(keys.policy, PolicyKey(POLICY));
        assert_eq!(se.channel_keys(), &keys.channel);
        assert_ne!(keys.channel, cfg.factory_keys().unwrap());
        // Stable across boots
        let again = reconstruct_keys(&mut nor, &mut puf, cfg.memory.key_store).unwrap();
        assert_eq!(again.channel, keys.channel);

        check_channel(&mut se, &keys, 1).unwrap();
    }

    #[test]
    fn uncommissioned_device() {
        let cfg = BootConfig::default();
        let mut flash = MemFlash::new(&cfg.memory);
        let mut se = SimSecureElement::new(3);
        let mut puf = SimPuf::new([9; 32], 4);
        let mut gpr = SimGpr::default();
        let mut nor = Nor::new(&mut flash, 1);
        let mut state = StateStore::new(&mut gpr);
        let r = provision(&mut nor, &mut se, &mut puf, &mut state, &cfg);
        assert!(matches!(r, Err(Error::NotCommissioned)));
        assert!(key_store_blank(&mut nor, cfg.memory.key_store).unwrap());
    }

    #[test]
    fn blank_store_cannot_be_reconstructed() {
        let cfg = BootConfig::default();
        let mut flash = MemFlash::new(&cfg.memory);
        let mut puf = SimPuf::new([9; 32], 4);
        let mut nor = Nor::new(&mut flash, 1);
        assert!(matches!(
            reconstruct_keys(&mut nor, &mut puf, cfg.memory.key_store),
            Err(Error::KeyReconstruction(_))
        ));
    }

    #[test]
    fn key_codes_are_bound_to_the_unit() {
        let cfg = BootConfig::default();
        let (mut flash, _, _, _) = provisioned(&cfg);
        let mut other = SimPuf::new([8; 32], 4);
        let mut nor = Nor::new(&mut flash, 1);
        assert!(reconstruct_keys(&mut nor, &mut other, cfg.memory.key_store).is_err());
    }

    #[test]
    fn hand_off_areas() {
        let cfg = BootConfig::default();
        let (mut flash, _, mut puf, _) = provisioned(&cfg);
        let mut nor = Nor::new(&mut flash, 1);
        let keys = reconstruct_keys(&mut nor, &mut puf, cfg.memory.key_store).unwrap();
        let mut soc = SimSoc::default();
        hand_off_log_keys(&mut soc, &keys.log).unwrap();
        hand_off_channel_keys(&mut soc, &keys.channel).unwrap();
        let mut got = [0u8; CHANNEL_KEYS_LEN];
        soc.ram_read(CHANNEL_KEYS_ADDR, &mut got).unwrap();
        assert_eq!(&got[..16], &keys.channel.enc);
        assert_eq!(&got[32..], &keys.channel.dek);
        let mut log = [0u8; LOG_KEYS_LEN];
        soc.ram_read(LOG_KEYS_ADDR, &mut log).unwrap();
        assert_eq!(&log[48..80], &keys.log.key);
    }
}
