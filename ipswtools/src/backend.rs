// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::irecv::RecoveryClient;
use crate::lockdown::LockdownClient;
use crate::restored::RestoredClient;
use crate::transport::{
    DeviceBackend, HotplugEvent, NormalPort, RecoveryPort, RestorePort,
};
use crate::{usbmux, Error};

/// The production backend: normal and restore modes through usbmuxd,
/// recovery mode over raw USB.
pub struct UsbBackend {
    udid: Option<String>,
}

impl UsbBackend {
    /// `udid` narrows every mux lookup to one device; recovery mode has no
    /// UDID to match and always takes the first device found.
    pub fn new(udid: Option<String>) -> Self {
        Self { udid }
    }
}

impl DeviceBackend for UsbBackend {
    fn open_normal(&mut self) -> Result<Box<dyn NormalPort>, Error> {
        let device = usbmux::find_device(self.udid.as_deref())?;
        Ok(Box::new(LockdownClient::connect(device.device_id)?))
    }

    fn open_recovery(&mut self) -> Result<Box<dyn RecoveryPort>, Error> {
        Ok(Box::new(RecoveryClient::open()?))
    }

    fn open_restore(&mut self) -> Result<Box<dyn RestorePort>, Error> {
        let device = usbmux::find_device(self.udid.as_deref())?;
        Ok(Box::new(RestoredClient::connect(device.device_id)?))
    }

    fn subscribe(
        &mut self,
        observer: Box<dyn Fn(HotplugEvent) + Send>,
    ) -> Result<(), Error> {
        usbmux::listen(self.udid.clone(), observer)
    }
}
