// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{with_attempts, Error};
use qmc_areas::{align_up, Extent, PAGE_SIZE, SECTOR_SIZE};

/// External flash
///
/// Erased cells read as `0xFF`; programming can only clear bits.
pub trait Flash {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error>;

    /// Erases `[addr, addr + len)`; both ends must be sector aligned
    fn erase(&mut self, addr: u32, len: u32) -> Result<(), Error>;

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), Error>;
}

/// Flash access with a per-operation attempt budget
pub struct Nor<'f> {
    dev: &'f mut dyn Flash,
    attempts: u32,
}

impl<'f> Nor<'f> {
    pub fn new(dev: &'f mut dyn Flash, attempts: u32) -> Self {
        Self { dev, attempts }
    }

    pub fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        let dev = &mut *self.dev;
        with_attempts("flash read", self.attempts, || dev.read(addr, buf))
    }

    pub fn read_vec(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    pub fn read_u32(&mut self, addr: u32) -> Result<u32, Error> {
        let mut word = [0u8; 4];
        self.read(addr, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Erases every sector touched by `[addr, addr + len)`
    pub fn erase(&mut self, addr: u32, len: u32) -> Result<(), Error> {
        if len == 0 {
            return Ok(());
        }
        let start = addr & !(SECTOR_SIZE - 1);
        let end = u64::from(addr) + u64::from(len);
        let span = u32::try_from(end - u64::from(start))
            .ok()
            .and_then(|s| align_up(s, SECTOR_SIZE))
            .ok_or(Error::Flash {
                op: "erase",
                addr,
                len: len as usize,
            })?;
        let dev = &mut *self.dev;
        with_attempts("flash erase", self.attempts, || dev.erase(start, span))
    }

    pub fn erase_extent(&mut self, extent: Extent) -> Result<(), Error> {
        self.erase(extent.start, extent.len)
    }

    /// Programs `data` one page at a time
    pub fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        let mut offset = 0usize;
        while offset < data.len() {
            let a = addr + offset as u32;
            // Never cross a page boundary in one operation
            let room = (PAGE_SIZE - (a % PAGE_SIZE)) as usize;
            let chunk = &data[offset..data.len().min(offset + room)];
            let dev = &mut *self.dev;
            with_attempts("flash program", self.attempts, || dev.program(a, chunk))?;
            offset += chunk.len();
        }
        Ok(())
    }

    /// Checks that flash at `addr` holds exactly `expected`
    pub fn compare(&mut self, addr: u32, expected: &[u8]) -> Result<(), Error> {
        let mut buf = [0u8; PAGE_SIZE as usize];
        for (i, want) in expected.chunks(buf.len()).enumerate() {
            let a = addr + (i * buf.len()) as u32;
            let got = &mut buf[..want.len()];
            self.read(a, got)?;
            if let Some(n) = got.iter().zip(want).position(|(g, w)| g != w) {
                return Err(Error::Compare { addr: a + n as u32 });
            }
        }
        Ok(())
    }

    /// Erases `dst` and programs it with `data`, then compares
    pub fn write(&mut self, dst: u32, data: &[u8]) -> Result<(), Error> {
        self.erase(dst, data.len() as u32)?;
        self.program(dst, data)?;
        self.compare(dst, data)
    }

    /// Copies `len` bytes from `src` to `dst`, erasing the destination first
    pub fn copy(&mut self, src: u32, dst: u32, len: u32) -> Result<(), Error> {
        self.erase(dst, len)?;
        self.copy_programmed(src, dst, len)
    }

    /// Copies into an already erased destination
    pub fn copy_programmed(&mut self, src: u32, dst: u32, len: u32) -> Result<(), Error> {
        let mut buf = [0u8; PAGE_SIZE as usize];
        let mut done = 0u32;
        while done < len {
            let n = (len - done).min(PAGE_SIZE) as usize;
            self.read(src + done, &mut buf[..n])?;
            self.program(dst + done, &buf[..n])?;
            done += n as u32;
        }
        Ok(())
    }

    /// Compares two flash ranges of `len` bytes
    pub fn compare_ranges(&mut self, a: u32, b: u32, len: u32) -> Result<(), Error> {
        let mut buf = [0u8; PAGE_SIZE as usize];
        let mut done = 0u32;
        while done < len {
            let n = (len - done).min(PAGE_SIZE) as usize;
            self.read(a + done, &mut buf[..n])?;
            let want = buf[..n].to_vec();
            self.compare(b + done, &want)?;
            done += n as u32;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemFlash;
    use qmc_areas::MemoryMap;

    fn flash() -> MemFlash {
        MemFlash::new(&MemoryMap::default())
    }

    #[test]
    fn erased_reads_ff() {
        let mut dev = flash();
        let mut nor = Nor::new(&mut dev, 1);
        assert_eq!(nor.read_u32(0x6008_0000).unwrap(), 0xFFFF_FFFF);
    }

    #[test]
    fn program_clears_bits_only() {
        let mut dev = flash();
        let mut nor = Nor::new(&mut dev, 1);
        nor.program(0x6008_0000, &[0x0F]).unwrap();
        nor.program(0x6008_0000, &[0xF1]).unwrap();
        assert_eq!(nor.read_vec(0x6008_0000, 1).unwrap(), vec![0x01]);
        assert!(matches!(
            nor.compare(0x6008_0000, &[0xF1]),
            Err(Error::Compare { addr: 0x6008_0000 })
        ));
    }

    #[test]
    fn erase_rounds_to_sectors() {
        let mut dev = flash();
        let mut nor = Nor::new(&mut dev, 1);
        nor.program(0x6008_0FFF, &[0, 0]).unwrap();
        nor.erase(0x6008_0FFF, 2).unwrap();
        assert_eq!(nor.read_vec(0x6008_0FFE, 4).unwrap(), vec![0xFF; 4]);
    }

    #[test]
    fn write_and_copy() {
        let mut dev = flash();
        let mut nor = Nor::new(&mut dev, 1);
        let data: Vec<u8> = (0..0x345u32).map(|i| i as u8).collect();
        nor.write(0x6008_0000, &data).unwrap();
        nor.copy(0x6008_0000, 0x6103_F000, data.len() as u32).unwrap();
        nor.compare_ranges(0x6008_0000, 0x6103_F000, data.len() as u32)
            .unwrap();
        nor.compare(0x6103_F000, &data).unwrap();
    }

    #[test]
    fn transient_faults_are_retried() {
        let mut dev = flash();
        dev.transient_program_faults = 2;
        let mut nor = Nor::new(&mut dev, 3);
        nor.write(0x6008_0000, &[1, 2, 3]).unwrap();

        let mut dev = flash();
        dev.transient_program_faults = 3;
        let mut nor = Nor::new(&mut dev, 3);
        assert!(matches!(
            nor.write(0x6008_0000, &[1, 2, 3]),
            Err(Error::Flash { op: "program", .. })
        ));
    }

    #[test]
    fn out_of_map_access_fails() {
        let mut dev = flash();
        let mut nor = Nor::new(&mut dev, 1);
        assert!(nor.read_u32(0x1000_0000).is_err());
        assert!(nor.program(0x1000_0000, &[0]).is_err());
    }
}
