// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Secure element service
//!
//! The secure element is an opaque authenticated service.  A [`Session`] is
//! an open encrypted channel; a [`PolicySession`] additionally holds the
//! policy authorization needed to write trusted versions.  Dropping either
//! closes the channel.

use crate::{
    keys::{ChannelKeys, PolicyKey},
    with_attempts, Error,
};
use log::{debug as okay, trace, warn};
use std::ops::{Deref, DerefMut};

/// Trusted firmware version
pub const FW_VERSION: u32 = 0x01;
/// Trusted update-manifest version
pub const MAN_VERSION: u32 = 0x02;
/// Update-package public key
pub const FWU_PUB_KEY: u32 = 0x0A;
/// Secure watchdog verification key
pub const RPC_KEY: u32 = 0x0C;
/// Firmware image public key
pub const FW_PUB_KEY: u32 = 0x0E;
/// Channel authorization object, created at commissioning
pub const AES_AUTH_OBJ: u32 = 0x1C;
/// Policy AES key, present only until first-boot provisioning
pub const AES_POLICY_KEY: u32 = 0x1D;

pub trait SecureElement {
    fn open_channel(&mut self, keys: &ChannelKeys) -> Result<(), Error>;
    fn close_channel(&mut self);

    /// Authorizes policy-protected writes for the open channel
    fn open_policy(&mut self, auth_obj: u32, key: &PolicyKey) -> Result<(), Error>;

    fn object_exists(&mut self, id: u32) -> Result<bool, Error>;
    fn read_u32(&mut self, id: u32) -> Result<u32, Error>;
    fn write_u32(&mut self, id: u32, value: u32) -> Result<(), Error>;
    fn read_object(&mut self, id: u32) -> Result<Vec<u8>, Error>;
    fn erase_object(&mut self, id: u32) -> Result<(), Error>;

    /// Verifies a DER-wrapped signature over `digest` with key object `key_id`
    fn verify_signature(&mut self, key_id: u32, digest: &[u8], sig: &[u8])
        -> Result<bool, Error>;

    fn random(&mut self, out: &mut [u8]) -> Result<(), Error>;

    fn rotate_channel_keys(&mut self, keys: &ChannelKeys) -> Result<(), Error>;
    fn scp_mandated(&mut self) -> Result<bool, Error>;
    fn set_scp_mandate(&mut self, mandated: bool) -> Result<(), Error>;
    fn factory_reset(&mut self) -> Result<(), Error>;
}

pub struct Session<'s> {
    se: &'s mut dyn SecureElement,
    attempts: u32,
}

impl<'s> Session<'s> {
    pub fn open(
        se: &'s mut dyn SecureElement,
        keys: &ChannelKeys,
        attempts: u32,
    ) -> Result<Self, Error> {
        with_attempts("open channel", attempts, || se.open_channel(keys))?;
        trace!("secure channel open");
        Ok(Self { se, attempts })
    }

    /// Upgrades to a policy session
    ///
    /// Fails with [`Error::NotCommissioned`] if the authorization object
    /// does not exist; that failure is never retried.
    pub fn open_policy(mut self, key: &PolicyKey) -> Result<PolicySession<'s>, Error> {
        if !self.object_exists(AES_AUTH_OBJ)? {
            return Err(Error::NotCommissioned);
        }
        let attempts = self.attempts;
        let se = &mut *self.se;
        with_attempts("open policy", attempts, || se.open_policy(AES_AUTH_OBJ, key))?;
        trace!("policy session open");
        Ok(PolicySession { session: self })
    }

    pub fn object_exists(&mut self, id: u32) -> Result<bool, Error> {
        let se = &mut *self.se;
        with_attempts("object exists", self.attempts, || se.object_exists(id))
    }

    pub fn read_u32(&mut self, id: u32) -> Result<u32, Error> {
        let se = &mut *self.se;
        with_attempts("read u32", self.attempts, || se.read_u32(id))
    }

    pub fn read_object(&mut self, id: u32) -> Result<Vec<u8>, Error> {
        let se = &mut *self.se;
        with_attempts("read object", self.attempts, || se.read_object(id))
    }

    pub fn random(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let mut out = vec![0u8; len];
        let se = &mut *self.se;
        with_attempts("random", self.attempts, || se.random(&mut out))?;
        Ok(out)
    }

    pub fn verify(&mut self, key_id: u32, digest: &[u8], sig: &[u8]) -> Result<(), Error> {
        let se = &mut *self.se;
        let ok = with_attempts("verify", self.attempts, || {
            se.verify_signature(key_id, digest, sig)
        })?;
        if ok {
            Ok(())
        } else {
            Err(Error::SignatureRejected)
        }
    }

    /// Mandates encrypted traffic if it is not yet mandated
    pub fn ensure_mandate(&mut self) -> Result<(), Error> {
        if !self.se.scp_mandated()? {
            self.se.set_scp_mandate(true)?;
            okay!("encrypted traffic now mandated");
        }
        Ok(())
    }

    /// Direct access for one-shot operations that take no retry
    pub fn device(&mut self) -> &mut dyn SecureElement {
        &mut *self.se
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.se.close_channel();
    }
}

pub struct PolicySession<'s> {
    session: Session<'s>,
}

impl PolicySession<'_> {
    /// Writes a policy-protected value and reads it back
    pub fn write_u32_verified(&mut self, id: u32, value: u32) -> Result<(), Error> {
        self.session.se.write_u32(id, value)?;
        let read = self.session.read_u32(id)?;
        if read != value {
            warn!("object {id:#04x}: wrote {value}, read back {read}");
            return Err(Error::SecureElement {
                op: "write read-back",
                id,
            });
        }
        Ok(())
    }
}

impl<'s> Deref for PolicySession<'s> {
    type Target = Session<'s>;
    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl<'s> DerefMut for PolicySession<'s> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.session
    }
}
