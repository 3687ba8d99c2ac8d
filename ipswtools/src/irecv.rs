// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The recovery-mode (iBoot) USB transport.
//!
//! A device in recovery mode does not register with the muxer; iBoot shows
//! up as a plain USB device and takes file uploads over a bulk endpoint
//! and commands over control transfers. The ECID rides in the USB serial
//! number string.

use std::time::Duration;

use log::debug;
use rusb::{DeviceHandle, GlobalContext};

use crate::transport::RecoveryPort;
use crate::Error;

const APPLE_VENDOR_ID: u16 = 0x05ac;
// Recovery and DFU product IDs across the supported devices.
const RECOVERY_PRODUCT_IDS: [u16; 4] = [0x1280, 0x1281, 0x1282, 0x1283];

const USB_TIMEOUT: Duration = Duration::from_secs(1);
const UPLOAD_CHUNK: usize = 0x800;
const BULK_OUT_ENDPOINT: u8 = 0x04;

pub struct RecoveryClient {
    handle: DeviceHandle<GlobalContext>,
    serial: String,
}

impl RecoveryClient {
    /// Opens the first device enumerating with a recovery product ID.
    pub fn open() -> Result<Self, Error> {
        let devices =
            rusb::devices().map_err(|e| Error::transport("irecovery", e))?;
        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if descriptor.vendor_id() != APPLE_VENDOR_ID
                || !RECOVERY_PRODUCT_IDS.contains(&descriptor.product_id())
            {
                continue;
            }

            let handle =
                device.open().map_err(|e| Error::transport("irecovery", e))?;
            handle
                .claim_interface(0)
                .map_err(|e| Error::transport("irecovery", e))?;
            let languages = handle
                .read_languages(USB_TIMEOUT)
                .map_err(|e| Error::transport("irecovery", e))?;
            let language = languages
                .first()
                .copied()
                .ok_or_else(|| Error::transport("irecovery", "no string descriptors"))?;
            let serial = handle
                .read_serial_number_string(language, &descriptor, USB_TIMEOUT)
                .map_err(|e| Error::transport("irecovery", e))?;
            debug!("recovery device: {serial}");
            return Ok(Self { handle, serial });
        }
        Err(Error::DeviceAbsent)
    }
}

impl RecoveryPort for RecoveryClient {
    fn ecid(&mut self) -> Result<u64, Error> {
        ecid_from_serial(&self.serial).ok_or(Error::IdentityUnavailable)
    }

    /// Stages a file into iBoot's upload buffer: a start transfer, the
    /// data in 2 KiB bulk chunks, then a commit transfer.
    fn upload_file(&mut self, data: &[u8]) -> Result<(), Error> {
        self.handle
            .write_control(0x41, 0, 0, 0, &[], USB_TIMEOUT)
            .map_err(|e| Error::transport("recovery upload", e))?;
        for chunk in data.chunks(UPLOAD_CHUNK) {
            let sent = self
                .handle
                .write_bulk(BULK_OUT_ENDPOINT, chunk, USB_TIMEOUT)
                .map_err(|e| Error::transport("recovery upload", e))?;
            if sent != chunk.len() {
                return Err(Error::transport("recovery upload", "short bulk write"));
            }
        }
        self.handle
            .write_control(0x41, 1, 0, 0, &[], USB_TIMEOUT)
            .map_err(|e| Error::transport("recovery upload", e))?;
        debug!("uploaded {} bytes", data.len());
        Ok(())
    }

    fn run_command(&mut self, command: &str) -> Result<(), Error> {
        debug!("iboot command: {command}");
        let mut buffer = command.as_bytes().to_vec();
        buffer.push(0);
        self.handle
            .write_control(0x40, 0, 0, 0, &buffer, USB_TIMEOUT)
            .map_err(|e| Error::transport("recovery command", e))?;
        Ok(())
    }
}

impl Drop for RecoveryClient {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(0);
    }
}

/// iBoot serial strings look like
/// `CPID:8900 CPFM:03 SCEP:03 BDID:00 ECID:000001234567890A IBFL:00`.
fn ecid_from_serial(serial: &str) -> Option<u64> {
    serial
        .split_whitespace()
        .find_map(|field| field.strip_prefix("ECID:"))
        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
}
