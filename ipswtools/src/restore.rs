// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The restore-mode message loop.
//!
//! Once the device reboots into the restore ramdisk it drives the session:
//! the host answers data-pull requests (filesystem image, kernelcache, NOR
//! bundle) and otherwise just watches progress go by until a terminal
//! status or the device disappears.

use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};
use plist::{Dictionary, Value};

use crate::bundle::FirmwareBundle;
use crate::component::signed_component;
use crate::session::SessionFlags;
use crate::ticket::{Selector, Ticket};
use crate::transport::RestorePort;
use crate::Error;

const RESTORED_SERVICE_TYPE: &str = "com.apple.mobile.restored";

/// Consecutive receive failures tolerated before the session is declared
/// dead. One-off failures are expected under retransmit.
const MAX_CONSECUTIVE_FAILURES: usize = 5;

/// An inbound message, classified on its `MsgType` string.
#[derive(Debug)]
enum Message {
    Progress(Dictionary),
    Status(Dictionary),
    DataRequest(DataType),
    Unknown(String),
}

/// What a `DataRequestMsg` is asking for.
#[derive(Debug, PartialEq, Eq)]
enum DataType {
    SystemImage,
    KernelCache,
    NorData,
    Other(String),
}

fn classify(message: &Value) -> Message {
    let Some(dict) = message.as_dictionary() else {
        return Message::Unknown("<not a dictionary>".to_owned());
    };
    let Some(msgtype) = dict.get("MsgType").and_then(Value::as_string) else {
        return Message::Unknown("<missing MsgType>".to_owned());
    };
    match msgtype {
        "ProgressMsg" => Message::Progress(dict.clone()),
        "StatusMsg" => Message::Status(dict.clone()),
        "DataRequestMsg" => {
            let datatype = dict.get("DataType").and_then(Value::as_string);
            Message::DataRequest(match datatype {
                Some("SystemImageData") => DataType::SystemImage,
                Some("KernelCache") => DataType::KernelCache,
                Some("NORData") => DataType::NorData,
                Some(other) => DataType::Other(other.to_owned()),
                None => DataType::Other("<missing DataType>".to_owned()),
            })
        }
        other => Message::Unknown(other.to_owned()),
    }
}

/// Services one restore session over an open restore port.
pub struct Dispatcher<'a> {
    port: &'a mut dyn RestorePort,
    bundle: &'a FirmwareBundle,
    ticket: &'a Ticket,
    flags: Arc<SessionFlags>,
    filesystem: &'a Path,
    custom: bool,
    dump: bool,
}

impl<'a> Dispatcher<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        port: &'a mut dyn RestorePort,
        bundle: &'a FirmwareBundle,
        ticket: &'a Ticket,
        flags: Arc<SessionFlags>,
        filesystem: &'a Path,
        custom: bool,
        dump: bool,
    ) -> Self {
        Self {
            port,
            bundle,
            ticket,
            flags,
            filesystem,
            custom,
            dump,
        }
    }

    /// Handshakes, starts the restore, and runs the message loop until the
    /// peer closes, a remove event latches `quit`, or the device asks for
    /// something unserviceable.
    pub fn run(&mut self) -> Result<(), Error> {
        let service = self.port.query_type()?;
        if service != RESTORED_SERVICE_TYPE {
            return Err(Error::NotInRestoreMode(service));
        }
        info!("device has successfully entered restore mode");

        self.port.start_restore()?;

        let mut consecutive_failures = 0usize;
        while !self.flags.quit() {
            let message = match self.port.receive() {
                Ok(Some(message)) => {
                    consecutive_failures = 0;
                    message
                }
                Ok(None) => {
                    info!("restore connection closed by the device");
                    break;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        "restore receive failed ({consecutive_failures} consecutive): {e}"
                    );
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        return Err(e);
                    }
                    continue;
                }
            };

            match classify(&message) {
                Message::Progress(dict) => handle_progress(&dict),
                Message::Status(dict) => {
                    if handle_status(&dict) {
                        self.flags.latch_quit();
                    }
                }
                // A failed data reply is logged, not fatal: the device
                // re-requests under retransmit, and a dead connection shows
                // up as receive failures anyway.
                Message::DataRequest(DataType::SystemImage) => {
                    info!("streaming filesystem image");
                    if let Err(e) = self.port.stream_image(self.filesystem) {
                        error!("filesystem streaming failed: {e}");
                    }
                }
                Message::DataRequest(DataType::KernelCache) => {
                    if let Err(e) = self.send_kernelcache() {
                        error!("kernelcache request failed: {e}");
                    }
                }
                Message::DataRequest(DataType::NorData) => {
                    if let Err(e) = self.send_nor_data() {
                        error!("NOR bundle request failed: {e}");
                    }
                }
                Message::DataRequest(DataType::Other(datatype)) => {
                    // The device blocks waiting for data we cannot produce;
                    // continuing would hang the restore.
                    error!("unknown data request: {datatype}");
                    return Err(Error::UnknownDataType(datatype));
                }
                Message::Unknown(msgtype) => {
                    info!("received unknown message type: {msgtype}");
                }
            }
        }
        Ok(())
    }

    fn send_kernelcache(&mut self) -> Result<(), Error> {
        let data = signed_component(
            self.bundle,
            self.ticket,
            Selector::Name("KernelCache"),
            self.custom,
            self.dump,
        )?;
        let mut reply = Dictionary::new();
        reply.insert("KernelCacheFile".into(), Value::Data(data));
        self.port.send(Value::Dictionary(reply))
    }

    /// Builds the NOR bundle: the LLB plus every other ticket entry living
    /// in the LLB's flash directory, each re-signed, in ticket order.
    fn send_nor_data(&mut self) -> Result<(), Error> {
        let llb = self.ticket.by_name("LLB")?;
        let llb_data = signed_component(
            self.bundle,
            self.ticket,
            Selector::Name("LLB"),
            self.custom,
            self.dump,
        )?;

        let flash_dir = match llb.path.rfind('/') {
            Some(idx) => &llb.path[..=idx],
            None => "",
        };

        let mut nor_images = Vec::new();
        for path in self.ticket.entry_paths() {
            if path == llb.path || !path.starts_with(flash_dir) {
                continue;
            }
            let data = signed_component(
                self.bundle,
                self.ticket,
                Selector::Path(&path),
                self.custom,
                self.dump,
            )?;
            nor_images.push(Value::Data(data));
        }

        let mut reply = Dictionary::new();
        reply.insert("LlbImageData".into(), Value::Data(llb_data));
        reply.insert("NorImageData".into(), Value::Array(nor_images));
        self.port.send(Value::Dictionary(reply))
    }
}

fn handle_progress(dict: &Dictionary) {
    let operation = dict.get("Operation").and_then(Value::as_unsigned_integer);
    let progress = dict.get("Progress").and_then(Value::as_unsigned_integer);
    match (operation, progress) {
        (Some(operation), Some(progress)) => {
            info!("operation {operation}: {progress}%")
        }
        _ => info!("progress message without operation/progress fields"),
    }
}

/// Returns whether the status ends the session.
fn handle_status(dict: &Dictionary) -> bool {
    match dict.get("Status").and_then(Value::as_unsigned_integer) {
        Some(0) => {
            info!("status: restore successful");
            true
        }
        Some(code) => {
            error!("status: restore failed with code {code}");
            true
        }
        None => {
            warn!("status message without a status code");
            false
        }
    }
}
