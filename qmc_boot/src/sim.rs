// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated board
//!
//! In-memory stand-ins for every collaborator of the boot path, used by the
//! tests and by `qmc-boot boot`.  They keep the properties the boot path
//! relies on (erase-before-program flash, stuck register bits, a secure
//! element that enforces its channel and policy state, a secondary core that
//! answers after a delay) and offer fault injection.

use crate::{
    boot::Board,
    config::FACTORY_KEY,
    event::{AesCtrCipher, LedPattern, Panel},
    flash::Flash,
    keys::{ChannelKeys, KeyWrapUnit, PolicyKey},
    persist::GprBank,
    se::{SecureElement, AES_AUTH_OBJ, AES_POLICY_KEY, FW_VERSION, MAN_VERSION, RPC_KEY},
    secwd::Soc,
    sign::verify_digest,
    update::RemovableMedia,
    Error,
};
use log::trace;
use qmc_areas::{state::GPR_COUNT, Extent, KeySlot, MemoryMap, SecWdInitData, SECTOR_SIZE};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use rsa::RsaPublicKey;
use secwd_token::{CORE1_RAM_BASE, CORE1_RAM_SIZE, INIT_DATA_ADDR, READY, RPC_SHM_ADDR, SHM_SIZE};
use sha2::{Digest as _, Sha256};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use zeroize::Zeroizing;

/// Sparse NOR flash covering the regions of a memory map
pub struct MemFlash {
    windows: Vec<Extent>,
    sectors: BTreeMap<u32, Vec<u8>>,
    /// Program operations that fail before one succeeds
    pub transient_program_faults: u32,
    /// Program operations touching this range always fail
    pub bad_range: Option<Extent>,
}

impl MemFlash {
    pub fn new(map: &MemoryMap) -> Self {
        Self {
            windows: map.regions().iter().map(|(_, e)| *e).collect(),
            sectors: BTreeMap::new(),
            transient_program_faults: 0,
            bad_range: None,
        }
    }

    fn check(&self, op: &'static str, addr: u32, len: usize) -> Result<(), Error> {
        if self
            .windows
            .iter()
            .any(|w| w.contains_range(addr, len as u64))
        {
            Ok(())
        } else {
            Err(Error::Flash { op, addr, len })
        }
    }

    /// Overwrites cells directly, bypassing erase rules
    pub fn load(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        self.check("load", addr, data.len())?;
        self.store(addr, data, |cell, byte| *cell = byte);
        Ok(())
    }

    /// Number of sectors holding anything but erased cells
    pub fn used_sectors(&self) -> usize {
        self.sectors.len()
    }

    fn erase_covering(&mut self, addr: u32, len: usize) {
        let start = addr & !(SECTOR_SIZE - 1);
        let end = u64::from(addr) + len as u64;
        let doomed: Vec<u32> = self
            .sectors
            .range(start..)
            .map(|(k, _)| *k)
            .take_while(|k| u64::from(*k) < end)
            .collect();
        for k in doomed {
            self.sectors.remove(&k);
        }
    }

    fn store(&mut self, addr: u32, data: &[u8], op: impl Fn(&mut u8, u8)) {
        let mut done = 0;
        while done < data.len() {
            let a = addr + done as u32;
            let base = a & !(SECTOR_SIZE - 1);
            let off = (a - base) as usize;
            let n = (SECTOR_SIZE as usize - off).min(data.len() - done);
            let sector = self
                .sectors
                .entry(base)
                .or_insert_with(|| vec![0xFF; SECTOR_SIZE as usize]);
            for (cell, byte) in sector[off..off + n].iter_mut().zip(&data[done..done + n]) {
                op(cell, *byte);
            }
            done += n;
        }
    }
}

impl Flash for MemFlash {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.check("read", addr, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let a = addr + done as u32;
            let base = a & !(SECTOR_SIZE - 1);
            let off = (a - base) as usize;
            let n = (SECTOR_SIZE as usize - off).min(buf.len() - done);
            match self.sectors.get(&base) {
                Some(s) => buf[done..done + n].copy_from_slice(&s[off..off + n]),
                None => buf[done..done + n].fill(0xFF),
            }
            done += n;
        }
        Ok(())
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<(), Error> {
        self.check("erase", addr, len as usize)?;
        if addr % SECTOR_SIZE != 0 || len % SECTOR_SIZE != 0 {
            return Err(Error::Flash {
                op: "erase",
                addr,
                len: len as usize,
            });
        }
        self.erase_covering(addr, len as usize);
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        self.check("program", addr, data.len())?;
        let fault = || Error::Flash {
            op: "program",
            addr,
            len: data.len(),
        };
        if self.transient_program_faults > 0 {
            self.transient_program_faults -= 1;
            return Err(fault());
        }
        if let Some(bad) = self.bad_range {
            if bad.overlaps(&Extent::new(addr, data.len() as u32)) {
                return Err(fault());
            }
        }
        self.store(addr, data, |cell, byte| *cell &= byte);
        Ok(())
    }
}

/// Battery-backed registers
///
/// Bits in `stuck_high` always read as one, bits in `stuck_low` as zero.
#[derive(Clone, Debug, Default)]
pub struct SimGpr {
    pub regs: [u32; GPR_COUNT],
    pub stuck_high: u32,
    pub stuck_low: u32,
}

impl GprBank for SimGpr {
    fn read_gpr(&mut self, idx: usize) -> Result<u32, Error> {
        self.regs
            .get(idx)
            .map(|v| (v | self.stuck_high) & !self.stuck_low)
            .ok_or(Error::StateReadback { wrote: 0, read: 0 })
    }

    fn write_gpr(&mut self, idx: usize, value: u32) -> Result<(), Error> {
        let reg = self
            .regs
            .get_mut(idx)
            .ok_or(Error::StateReadback { wrote: value, read: 0 })?;
        *reg = value;
        Ok(())
    }
}

/// Secure element holding objects, verification keys and channel state
pub struct SimSecureElement {
    keys: ChannelKeys,
    open: bool,
    policy: bool,
    mandated: bool,
    objects: BTreeMap<u32, Vec<u8>>,
    verify_keys: BTreeMap<u32, RsaPublicKey>,
    rng: StdRng,
    /// Channel opens that fail before one succeeds
    pub transient_open_faults: u32,
    /// Objects whose reads always fail
    pub unreadable: Vec<u32>,
}

impl SimSecureElement {
    pub fn new(seed: u64) -> Self {
        Self {
            keys: ChannelKeys {
                enc: FACTORY_KEY,
                mac: FACTORY_KEY,
                dek: FACTORY_KEY,
            },
            open: false,
            policy: false,
            mandated: false,
            objects: BTreeMap::new(),
            verify_keys: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
            transient_open_faults: 0,
            unreadable: vec![],
        }
    }

    /// Creates the authorization and policy key objects
    pub fn commission(&mut self, policy: PolicyKey) {
        self.objects.insert(AES_AUTH_OBJ, policy.0.to_vec());
        self.objects.insert(AES_POLICY_KEY, policy.0.to_vec());
        self.objects.insert(FW_VERSION, 0u32.to_le_bytes().to_vec());
        self.objects.insert(MAN_VERSION, 0u32.to_le_bytes().to_vec());
        let mut rpc_key = vec![0u8; 91];
        self.rng.fill_bytes(&mut rpc_key);
        self.objects.insert(RPC_KEY, rpc_key);
    }

    pub fn install_key(&mut self, id: u32, key: RsaPublicKey) {
        self.objects.insert(id, vec![]);
        self.verify_keys.insert(id, key);
    }

    pub fn set_version(&mut self, id: u32, version: u32) {
        self.objects.insert(id, version.to_le_bytes().to_vec());
    }

    pub fn version(&self, id: u32) -> Option<u32> {
        let v: [u8; 4] = self.objects.get(&id)?.as_slice().try_into().ok()?;
        Some(u32::from_le_bytes(v))
    }

    pub fn has_object(&self, id: u32) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn object(&self, id: u32) -> Option<&[u8]> {
        self.objects.get(&id).map(|v| v.as_slice())
    }

    pub fn channel_keys(&self) -> &ChannelKeys {
        &self.keys
    }

    pub fn channel_open(&self) -> bool {
        self.open
    }

    pub fn mandated(&self) -> bool {
        self.mandated
    }

    fn require_open(&self) -> Result<(), Error> {
        if self.open {
            Ok(())
        } else {
            Err(Error::Channel("channel not open"))
        }
    }
}

impl SecureElement for SimSecureElement {
    fn open_channel(&mut self, keys: &ChannelKeys) -> Result<(), Error> {
        if self.transient_open_faults > 0 {
            self.transient_open_faults -= 1;
            return Err(Error::Channel("no answer"));
        }
        if *keys != self.keys {
            return Err(Error::Channel("channel authentication failed"));
        }
        self.open = true;
        self.policy = false;
        Ok(())
    }

    fn close_channel(&mut self) {
        self.open = false;
        self.policy = false;
    }

    fn open_policy(&mut self, auth_obj: u32, key: &PolicyKey) -> Result<(), Error> {
        self.require_open()?;
        match self.objects.get(&auth_obj) {
            Some(v) if v.as_slice() == key.0 => {
                self.policy = true;
                Ok(())
            }
            Some(_) => Err(Error::Channel("policy authentication failed")),
            None => Err(Error::NotCommissioned),
        }
    }

    fn object_exists(&mut self, id: u32) -> Result<bool, Error> {
        self.require_open()?;
        Ok(self.objects.contains_key(&id))
    }

    fn read_u32(&mut self, id: u32) -> Result<u32, Error> {
        self.require_open()?;
        if self.unreadable.contains(&id) {
            return Err(Error::SecureElement { op: "read", id });
        }
        self.version(id)
            .ok_or(Error::SecureElement { op: "read", id })
    }

    fn write_u32(&mut self, id: u32, value: u32) -> Result<(), Error> {
        self.require_open()?;
        if !self.policy {
            return Err(Error::SecureElement {
                op: "write without policy",
                id,
            });
        }
        self.set_version(id, value);
        Ok(())
    }

    fn read_object(&mut self, id: u32) -> Result<Vec<u8>, Error> {
        self.require_open()?;
        if self.unreadable.contains(&id) {
            return Err(Error::SecureElement { op: "read", id });
        }
        self.objects
            .get(&id)
            .cloned()
            .ok_or(Error::SecureElement { op: "read", id })
    }

    fn erase_object(&mut self, id: u32) -> Result<(), Error> {
        self.require_open()?;
        self.objects
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::SecureElement { op: "erase", id })
    }

    fn verify_signature(
        &mut self,
        key_id: u32,
        digest: &[u8],
        sig: &[u8],
    ) -> Result<bool, Error> {
        self.require_open()?;
        let key = self
            .verify_keys
            .get(&key_id)
            .ok_or(Error::SecureElement {
                op: "verify",
                id: key_id,
            })?;
        Ok(verify_digest(key, digest, sig))
    }

    fn random(&mut self, out: &mut [u8]) -> Result<(), Error> {
        self.require_open()?;
        self.rng.fill_bytes(out);
        Ok(())
    }

    fn rotate_channel_keys(&mut self, keys: &ChannelKeys) -> Result<(), Error> {
        self.require_open()?;
        self.keys = keys.clone();
        Ok(())
    }

    fn scp_mandated(&mut self) -> Result<bool, Error> {
        self.require_open()?;
        Ok(self.mandated)
    }

    fn set_scp_mandate(&mut self, mandated: bool) -> Result<(), Error> {
        self.require_open()?;
        self.mandated = mandated;
        Ok(())
    }

    fn factory_reset(&mut self) -> Result<(), Error> {
        self.require_open()?;
        self.objects.clear();
        self.verify_keys.clear();
        self.mandated = false;
        self.keys = ChannelKeys {
            enc: FACTORY_KEY,
            mac: FACTORY_KEY,
            dek: FACTORY_KEY,
        };
        Ok(())
    }
}

/// Key-wrapping unit bound to a device secret
///
/// A key code is `[slot, 0, len (u16)] | key ^ stream | tag`, where the
/// stream and the 32-byte tag are derived from the secret and the slot.
pub struct SimPuf {
    secret: [u8; 32],
    rng: StdRng,
}

impl SimPuf {
    pub fn new(secret: [u8; 32], seed: u64) -> Self {
        Self {
            secret,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn stream(&self, slot: KeySlot, len: usize) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(len + 32));
        let mut counter = 0u32;
        while out.len() < len {
            let block = Sha256::new()
                .chain_update(self.secret)
                .chain_update([slot.index()])
                .chain_update(b"stream")
                .chain_update(counter.to_le_bytes())
                .finalize();
            out.extend_from_slice(&block);
            counter += 1;
        }
        out.truncate(len);
        out
    }

    fn tag(&self, slot: KeySlot, key: &[u8]) -> [u8; 32] {
        Sha256::new()
            .chain_update(self.secret)
            .chain_update([slot.index()])
            .chain_update(b"tag")
            .chain_update(key)
            .finalize()
            .into()
    }
}

impl KeyWrapUnit for SimPuf {
    fn generate(&mut self, slot: KeySlot, len: usize) -> Result<Vec<u8>, Error> {
        let mut key = Zeroizing::new(vec![0u8; len]);
        self.rng.fill_bytes(&mut key);
        self.wrap(slot, &key)
    }

    fn wrap(&mut self, slot: KeySlot, key: &[u8]) -> Result<Vec<u8>, Error> {
        let len = u16::try_from(key.len()).map_err(|_| Error::KeyReconstruction("key too long"))?;
        let mut code = vec![slot.index(), 0];
        code.extend(len.to_le_bytes());
        let stream = self.stream(slot, key.len());
        code.extend(key.iter().zip(stream.iter()).map(|(k, s)| k ^ s));
        code.extend(self.tag(slot, key));
        Ok(code)
    }

    fn unwrap(&mut self, slot: KeySlot, code: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        if code.len() < 4 + 32 || code[0] != slot.index() {
            return Err(Error::KeyReconstruction("key code does not match slot"));
        }
        let len = usize::from(u16::from_le_bytes([code[2], code[3]]));
        if code.len() != 4 + len + 32 {
            return Err(Error::KeyReconstruction("key code has the wrong length"));
        }
        let stream = self.stream(slot, len);
        let key: Zeroizing<Vec<u8>> = Zeroizing::new(
            code[4..4 + len]
                .iter()
                .zip(stream.iter())
                .map(|(c, s)| c ^ s)
                .collect(),
        );
        if self.tag(slot, &key) != code[4 + len..] {
            return Err(Error::KeyReconstruction("key code failed authentication"));
        }
        Ok(key)
    }
}

/// How the secondary core reacts to being released
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Peer {
    /// Reports ready once this many milliseconds have passed
    ReadyAfter(u32),
    Never,
}

/// Secondary-core RAM, the shared window and a millisecond clock
pub struct SimSoc {
    pub(crate) core1_ram: Vec<u8>,
    pub(crate) shm: Vec<u8>,
    pub peer: Peer,
    pub released_at: Option<u32>,
    pub(crate) released_clock: u32,
    pub clock_ms: u32,
    pub ready_polls: u32,
    /// Public key the secondary core took from the bootstrap record
    pub received_pk: Option<Vec<u8>>,
}

impl Default for SimSoc {
    fn default() -> Self {
        Self {
            core1_ram: vec![0; CORE1_RAM_SIZE as usize],
            shm: vec![0; SHM_SIZE as usize],
            peer: Peer::ReadyAfter(15),
            released_at: None,
            released_clock: 0,
            clock_ms: 0,
            ready_polls: 0,
            received_pk: None,
        }
    }
}

impl SimSoc {
    fn ready_addr() -> u32 {
        INIT_DATA_ADDR + SecWdInitData::ready_offset() as u32
    }

    fn window(&mut self, addr: u32, len: usize) -> Result<&mut [u8], Error> {
        let core1_ram = Extent::new(CORE1_RAM_BASE, CORE1_RAM_SIZE);
        let shm = Extent::new(RPC_SHM_ADDR, SHM_SIZE);
        let (base, mem) = if core1_ram.contains_range(addr, len as u64) {
            (CORE1_RAM_BASE, &mut self.core1_ram)
        } else if shm.contains_range(addr, len as u64) {
            (RPC_SHM_ADDR, &mut self.shm)
        } else {
            return Err(Error::SharedRam { addr });
        };
        let off = (addr - base) as usize;
        Ok(&mut mem[off..off + len])
    }

    /// Puts the secondary core back into reset
    pub fn reset(&mut self) {
        self.released_at = None;
        self.ready_polls = 0;
        self.received_pk = None;
    }

    /// Secondary-core side: takes the key out of the bootstrap record and
    /// flags readiness
    fn consume_bootstrap(&mut self) {
        let data = match self.peek(INIT_DATA_ADDR, SecWdInitData::SIZE) {
            Ok(raw) => match SecWdInitData::parse(&raw) {
                Ok(data) => data,
                Err(_) => return,
            },
            Err(_) => return,
        };
        let Some(pk) = data.pk.get(..data.pk_len.get() as usize) else {
            trace!("bootstrap record carries a bad key length");
            return;
        };
        self.received_pk = Some(pk.to_vec());
        if let Ok(cell) = self.window(Self::ready_addr(), 1) {
            cell[0] = READY;
        }
    }

    /// Returns a copy of shared memory
    pub fn peek(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, Error> {
        Ok(self.window(addr, len)?.to_vec())
    }
}

impl Soc for SimSoc {
    fn ram_write(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        self.window(addr, data.len())?.copy_from_slice(data);
        Ok(())
    }

    fn ram_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        if addr == Self::ready_addr() && buf.len() == 1 {
            self.ready_polls += 1;
        }
        buf.copy_from_slice(self.window(addr, buf.len())?);
        Ok(())
    }

    fn release_secondary(&mut self, boot_addr: u32) -> Result<(), Error> {
        trace!("secondary core released at {boot_addr:#010x}");
        self.released_at = Some(boot_addr);
        self.released_clock = self.clock_ms;
        self.received_pk = None;
        Ok(())
    }

    fn delay_ms(&mut self, ms: u32) {
        self.clock_ms += ms;
        if let (Some(_), Peer::ReadyAfter(after)) = (self.released_at, self.peer) {
            if self.clock_ms - self.released_clock >= after && self.received_pk.is_none() {
                self.consume_bootstrap();
            }
        }
    }
}

/// Removable media held in memory
#[derive(Clone, Debug, Default)]
pub struct MemMedia {
    pub inserted: bool,
    files: BTreeMap<String, Vec<u8>>,
}

impl MemMedia {
    pub fn inserted() -> Self {
        Self {
            inserted: true,
            ..Default::default()
        }
    }

    pub fn put(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(path.to_string(), data);
    }

    fn file(&self, path: &str) -> Result<&Vec<u8>, Error> {
        if !self.inserted {
            return Err(Error::Media("no media"));
        }
        self.files.get(path).ok_or(Error::Media("no such file"))
    }
}

impl RemovableMedia for MemMedia {
    fn is_inserted(&mut self) -> bool {
        self.inserted
    }

    fn exists(&mut self, path: &str) -> Result<bool, Error> {
        Ok(self.inserted && self.files.contains_key(path))
    }

    fn len(&mut self, path: &str) -> Result<u64, Error> {
        Ok(self.file(path)?.len() as u64)
    }

    fn read_at(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        let f = self.file(path)?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(f.len());
        let n = buf.len().min(f.len() - start);
        buf[..n].copy_from_slice(&f[start..start + n]);
        Ok(n)
    }

    fn delete(&mut self, path: &str) -> Result<(), Error> {
        self.file(path)?;
        self.files.remove(path);
        Ok(())
    }
}

/// Removable media backed by a host directory
///
/// Media paths are taken relative to `root`.
pub struct DirMedia {
    root: PathBuf,
}

impl DirMedia {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, path: &str) -> PathBuf {
        self.root.join(Path::new(path.trim_start_matches('/')))
    }
}

impl RemovableMedia for DirMedia {
    fn is_inserted(&mut self) -> bool {
        self.root.is_dir()
    }

    fn exists(&mut self, path: &str) -> Result<bool, Error> {
        Ok(self.path(path).is_file())
    }

    fn len(&mut self, path: &str) -> Result<u64, Error> {
        Ok(std::fs::metadata(self.path(path))?.len())
    }

    fn read_at(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        use std::io::{Read as _, Seek as _, SeekFrom};
        let mut f = std::fs::File::open(self.path(path))?;
        f.seek(SeekFrom::Start(offset))?;
        Ok(f.read(buf)?)
    }

    fn delete(&mut self, path: &str) -> Result<(), Error> {
        Ok(std::fs::remove_file(self.path(path))?)
    }
}

/// Buttons and indicator lines
///
/// The buttons read as pressed for `pressed_reads` reads.
#[derive(Clone, Debug, Default)]
pub struct SimPanel {
    pub pressed_reads: u32,
    pub shown: Vec<LedPattern>,
}

impl SimPanel {
    pub fn held() -> Self {
        Self {
            pressed_reads: u32::MAX,
            ..Default::default()
        }
    }
}

impl Panel for SimPanel {
    fn buttons_pressed(&mut self) -> bool {
        match self.pressed_reads {
            0 => false,
            u32::MAX => true,
            _ => {
                self.pressed_reads -= 1;
                true
            }
        }
    }

    fn show(&mut self, pattern: LedPattern) {
        self.shown.push(pattern);
    }
}

/// Every simulated collaborator of one device
pub struct SimBoard {
    pub flash: MemFlash,
    pub gpr: SimGpr,
    pub se: SimSecureElement,
    pub puf: SimPuf,
    pub media: Box<dyn RemovableMedia>,
    pub soc: SimSoc,
    pub panel: SimPanel,
    pub cipher: AesCtrCipher,
}

impl SimBoard {
    /// A factory-fresh device; `seed` makes its secrets reproducible
    pub fn new(map: &MemoryMap, seed: u64) -> Self {
        let mut secret = [0u8; 32];
        StdRng::seed_from_u64(seed).fill_bytes(&mut secret);
        Self {
            flash: MemFlash::new(map),
            gpr: SimGpr::default(),
            se: SimSecureElement::new(seed),
            puf: SimPuf::new(secret, seed.wrapping_add(1)),
            media: Box::new(MemMedia::default()),
            soc: SimSoc::default(),
            panel: SimPanel::default(),
            cipher: AesCtrCipher::default(),
        }
    }

    /// Commissions the secure element with the image verification keys
    pub fn commission(&mut self, fw_key: RsaPublicKey, fwu_key: RsaPublicKey) {
        let mut policy = [0u8; 16];
        self.se.rng.fill_bytes(&mut policy);
        self.se.commission(PolicyKey(policy));
        self.se.install_key(crate::se::FW_PUB_KEY, fw_key);
        self.se.install_key(crate::se::FWU_PUB_KEY, fwu_key);
    }

    pub fn board(&mut self) -> Board<'_> {
        Board {
            flash: &mut self.flash,
            gpr: &mut self.gpr,
            se: &mut self.se,
            puf: &mut self.puf,
            media: self.media.as_mut(),
            soc: &mut self.soc,
            panel: &mut self.panel,
            cipher: &mut self.cipher,
        }
    }

    /// Everything volatile is lost
    pub fn power_cycle(&mut self) {
        self.soc.reset();
        self.se.close_channel();
        self.cipher = AesCtrCipher::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn puf_round_trip_and_binding() {
        let mut puf = SimPuf::new([1; 32], 0);
        let code = puf.generate(KeySlot::LogKey, 32).unwrap();
        assert_eq!(code.len(), 68);
        let key = puf.unwrap(KeySlot::LogKey, &code).unwrap();
        assert_eq!(key.len(), 32);
        assert!(puf.unwrap(KeySlot::LogNonce, &code).is_err());
        let mut tampered = code.clone();
        tampered[10] ^= 1;
        assert!(puf.unwrap(KeySlot::LogKey, &tampered).is_err());
    }

    #[test]
    fn dir_media() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("qmc2")).unwrap();
        std::fs::write(dir.path().join("qmc2/fw_update.bin"), b"hello world").unwrap();
        let mut media = DirMedia::new(dir.path());
        assert!(media.is_inserted());
        assert!(media.exists("/qmc2/fw_update.bin").unwrap());
        assert_eq!(media.len("/qmc2/fw_update.bin").unwrap(), 11);
        let mut buf = [0u8; 5];
        assert_eq!(media.read_at("/qmc2/fw_update.bin", 6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");
        media.delete("/qmc2/fw_update.bin").unwrap();
        assert!(!media.exists("/qmc2/fw_update.bin").unwrap());
        assert!(!media.exists("/qmc2/decommission.bin").unwrap());
    }

    #[test]
    fn removed_media() {
        let mut media = MemMedia::default();
        media.put("/a", vec![1]);
        assert!(!media.is_inserted());
        assert!(!media.exists("/a").unwrap());
        assert!(media.len("/a").is_err());
    }

    #[test]
    fn soc_windows() {
        let mut soc = SimSoc::default();
        soc.ram_write(CORE1_RAM_BASE, &[1, 2, 3]).unwrap();
        assert_eq!(soc.peek(CORE1_RAM_BASE, 3).unwrap(), vec![1, 2, 3]);
        assert!(soc.ram_write(CORE1_RAM_BASE + CORE1_RAM_SIZE - 1, &[0, 0]).is_err());
        assert!(soc.ram_write(0x1000_0000, &[0]).is_err());
    }

    #[test]
    fn stuck_gpr_bits() {
        let mut gpr = SimGpr {
            stuck_high: 0x8000_0000,
            ..Default::default()
        };
        gpr.write_gpr(0, 1).unwrap();
        assert_eq!(gpr.read_gpr(0).unwrap(), 0x8000_0001);
        assert!(gpr.read_gpr(4).is_err());
    }
}
