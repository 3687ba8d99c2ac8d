// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seam between the restore pipeline and the device transports.
//!
//! Each of the device's three bootstates exposes a different channel; the
//! pipeline consumes them through these traits so it can be driven against
//! scripted implementations. The working clients (lockdownd, iBoot USB,
//! restored) are composed by [`UsbBackend`](crate::UsbBackend).

use std::path::Path;

use crate::Error;

/// A device appearing on or vanishing from the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    Add,
    Remove,
}

/// The normal-mode identity service: the one channel that can report the
/// chip identifier before the restore begins, and the only way to ask the
/// device to reboot into recovery.
pub trait NormalPort {
    fn unique_chip_id(&mut self) -> Result<u64, Error>;

    /// Sends the recovery command and disconnects. The device drops off the
    /// bus and reappears in recovery mode; reopening is the caller's job.
    fn enter_recovery(&mut self) -> Result<(), Error>;
}

/// The recovery-mode (iBoot) channel: file upload plus command execution.
pub trait RecoveryPort {
    fn ecid(&mut self) -> Result<u64, Error>;
    fn upload_file(&mut self, data: &[u8]) -> Result<(), Error>;
    fn run_command(&mut self, command: &str) -> Result<(), Error>;
}

/// The restore-mode agent's structured message channel.
pub trait RestorePort {
    /// The peer's service type; anything but the restore agent means the
    /// device is not actually in restore mode.
    fn query_type(&mut self) -> Result<String, Error>;

    fn start_restore(&mut self) -> Result<(), Error>;

    /// Blocks for the next message. `Ok(None)` is a clean close by the peer.
    fn receive(&mut self) -> Result<Option<plist::Value>, Error>;

    fn send(&mut self, message: plist::Value) -> Result<(), Error>;

    /// Streams the extracted filesystem image to the device's ASR agent.
    fn stream_image(&mut self, image: &Path) -> Result<(), Error>;
}

/// Opens the mode-specific ports and delivers hotplug events.
pub trait DeviceBackend {
    fn open_normal(&mut self) -> Result<Box<dyn NormalPort>, Error>;
    fn open_recovery(&mut self) -> Result<Box<dyn RecoveryPort>, Error>;
    fn open_restore(&mut self) -> Result<Box<dyn RestorePort>, Error>;

    /// Registers the hotplug observer. The observer runs on the backend's
    /// event thread and must confine itself to the session flags.
    fn subscribe(
        &mut self,
        observer: Box<dyn Fn(HotplugEvent) + Send>,
    ) -> Result<(), Error>;
}

/// The port found by probing, still open so the caller can read the ECID
/// without a second enumeration.
pub enum DetectedDevice {
    Normal(Box<dyn NormalPort>),
    Recovery(Box<dyn RecoveryPort>),
}

/// Probes for a device: normal mode first, recovery second.
pub fn detect(backend: &mut dyn DeviceBackend) -> Result<DetectedDevice, Error> {
    log::info!("checking for device in normal mode");
    match backend.open_normal() {
        Ok(port) => return Ok(DetectedDevice::Normal(port)),
        Err(e) => log::debug!("no normal-mode device: {e}"),
    }
    log::info!("checking for device in recovery mode");
    match backend.open_recovery() {
        Ok(port) => Ok(DetectedDevice::Recovery(port)),
        Err(e) => {
            log::debug!("no recovery-mode device: {e}");
            Err(Error::DeviceAbsent)
        }
    }
}
