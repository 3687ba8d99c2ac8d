// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pushing the bootchain to a recovery-mode device.

use std::io::Read;
use std::thread;
use std::time::Duration;

use log::info;

use crate::bundle::FirmwareBundle;
use crate::component::signed_component;
use crate::ticket::{Selector, Ticket};
use crate::transport::RecoveryPort;
use crate::Error;

/// Invoked between the ramdisk and kernelcache uploads, when iBoot needs a
/// hard reset before it will accept anything further. The default blocks on
/// the operator; automated rigs whose hardware no longer needs the reset
/// can pass a no-op.
pub type CheckpointHook = Box<dyn FnMut() -> Result<(), Error>>;

/// The interactive checkpoint: prompt, then wait for one keystroke.
pub fn stdin_checkpoint() -> CheckpointHook {
    Box::new(|| {
        println!("Please unplug your device, then plug it back in");
        println!("Hit any key to continue...");
        let mut byte = [0u8; 1];
        std::io::stdin()
            .read(&mut byte)
            .map_err(|e| Error::transport("checkpoint", e))?;
        Ok(())
    })
}

/// Sends the five bootchain stages in their required order.
///
/// iBEC boots first and needs a second to come up before iBoot will take
/// the next upload. The remaining stages are staged into memory and the
/// final `bootx` hands control to the restore ramdisk's kernel.
pub fn send_bootchain(
    port: &mut dyn RecoveryPort,
    bundle: &FirmwareBundle,
    ticket: &Ticket,
    custom: bool,
    dump: bool,
    checkpoint: &mut CheckpointHook,
) -> Result<(), Error> {
    port.run_command("setenv auto-boot true")?;
    port.run_command("saveenv")?;

    upload(port, bundle, ticket, custom, dump, "iBEC", "go")?;
    thread::sleep(Duration::from_secs(1));

    upload(port, bundle, ticket, custom, dump, "AppleLogo", "setpicture")?;
    upload(port, bundle, ticket, custom, dump, "DeviceTree", "devicetree")?;
    upload(port, bundle, ticket, custom, dump, "Ramdisk", "ramdisk")?;

    checkpoint()?;

    upload(port, bundle, ticket, custom, dump, "KernelCache", "bootx")?;
    Ok(())
}

fn upload(
    port: &mut dyn RecoveryPort,
    bundle: &FirmwareBundle,
    ticket: &Ticket,
    custom: bool,
    dump: bool,
    component: &str,
    command: &str,
) -> Result<(), Error> {
    info!("sending {component}");
    let data = signed_component(bundle, ticket, Selector::Name(component), custom, dump)?;
    port.upload_file(&data)?;
    port.run_command(command)
}
