// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::Error;
use log::{debug as okay, trace};
use qmc_areas::{
    state::{GPR_COUNT, STATE_GPR},
    BootState,
};

/// Battery-backed general purpose registers
pub trait GprBank {
    fn read_gpr(&mut self, idx: usize) -> Result<u32, Error>;
    fn write_gpr(&mut self, idx: usize, value: u32) -> Result<(), Error>;
}

/// Durable boot state; every write is verified by reading it back
pub struct StateStore<'g> {
    bank: &'g mut dyn GprBank,
}

impl<'g> StateStore<'g> {
    pub fn new(bank: &'g mut dyn GprBank) -> Self {
        Self { bank }
    }

    fn write_word(&mut self, idx: usize, wrote: u32) -> Result<(), Error> {
        self.bank.write_gpr(idx, wrote)?;
        let read = self.bank.read_gpr(idx)?;
        if read != wrote {
            return Err(Error::StateReadback { wrote, read });
        }
        Ok(())
    }

    /// Zeroes every register of the bank
    pub fn init(&mut self) -> Result<(), Error> {
        for idx in 0..GPR_COUNT {
            self.write_word(idx, 0)?;
        }
        okay!("durable state registers cleared");
        Ok(())
    }

    pub fn read(&mut self) -> Result<BootState, Error> {
        let word = self.bank.read_gpr(STATE_GPR)?;
        let state = BootState::from_word(word)?;
        trace!("durable state {word:#010x}: {state:?}");
        Ok(state)
    }

    pub fn write(&mut self, state: &BootState) -> Result<(), Error> {
        let word = state.to_word()?;
        self.write_word(STATE_GPR, word)?;
        trace!("durable state now {word:#010x}");
        Ok(())
    }
}
