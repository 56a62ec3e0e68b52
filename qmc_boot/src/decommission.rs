// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{
    config::BootConfig, event::Panel, flash::Nor, se::Session, update::RemovableMedia, Error,
};
use log::{info, trace, warn};

/// Returns true if the operator asked for decommissioning
///
/// The buttons must be held both before and after the file check.
pub fn requested(
    panel: &mut dyn Panel,
    media: &mut dyn RemovableMedia,
    cfg: &BootConfig,
) -> Result<bool, Error> {
    if !panel.buttons_pressed() {
        return Ok(false);
    }
    if !media.is_inserted() || !media.exists(&cfg.decommission_file)? {
        trace!("buttons held but no decommission file");
        return Ok(false);
    }
    if !panel.buttons_pressed() {
        warn!("buttons released during decommission check");
        return Ok(false);
    }
    Ok(true)
}

/// Wipes every image, configuration and log region and returns the secure
/// element to its factory state
pub fn decommission(flash: &mut Nor, session: &mut Session, cfg: &BootConfig) -> Result<(), Error> {
    let map = &cfg.memory;
    info!("decommissioning device");
    for extent in [
        map.recovery,
        map.cfg_backup,
        map.main_fw,
        map.staging,
        map.event_log,
        map.cfg_data,
    ] {
        flash.erase_extent(extent)?;
        trace!("erased {extent}");
    }

    let factory = cfg.factory_keys()?;
    let se = session.device();
    se.rotate_channel_keys(&factory)?;
    se.set_scp_mandate(false)?;
    se.factory_reset()?;
    trace!("secure element returned to factory state");

    flash.erase_extent(map.key_store)?;
    info!("device decommissioned");
    Ok(())
}
