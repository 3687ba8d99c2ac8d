// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the usbmuxd device multiplexer.
//!
//! The daemon owns the USB side of every normal- and restore-mode device
//! and exposes it over a Unix socket: a 16-byte little-endian header
//! framing an XML plist per message. A `Connect` upgrades the socket into
//! a raw byte pipe to a TCP port on the device; lockdownd, restored, and
//! the ASR agent are all reached that way.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;

use log::{debug, warn};
use plist::{Dictionary, Value};

use crate::transport::HotplugEvent;
use crate::{props, Error};

const SOCKET_PATH: &str = "/var/run/usbmuxd";
const MUX_VERSION: u32 = 1;
const MUX_PLIST_MESSAGE: u32 = 8;
const MUX_HEADER_LEN: usize = 16;
const CLIENT_NAME: &str = "idevrestore";

/// Control requests to the daemon answer promptly; only the hotplug
/// listener waits indefinitely.
const CONTROL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// One device as the muxer reports it.
#[derive(Debug, Clone)]
pub(crate) struct DeviceEntry {
    pub(crate) device_id: u64,
    pub(crate) udid: String,
}

pub(crate) struct MuxConnection {
    stream: UnixStream,
    tag: u32,
}

impl MuxConnection {
    pub(crate) fn open() -> Result<Self, Error> {
        let stream = UnixStream::connect(SOCKET_PATH)
            .map_err(|e| Error::transport("usbmuxd", e))?;
        stream
            .set_read_timeout(Some(CONTROL_TIMEOUT))
            .map_err(|e| Error::transport("usbmuxd", e))?;
        Ok(Self { stream, tag: 0 })
    }

    fn send(&mut self, message: &Dictionary) -> Result<(), Error> {
        let mut xml = Vec::new();
        Value::Dictionary(message.clone()).to_writer_xml(&mut xml)?;
        self.tag += 1;
        let header = encode_header(xml.len(), self.tag);
        self.stream
            .write_all(&header)
            .and_then(|_| self.stream.write_all(&xml))
            .map_err(|e| Error::transport("usbmuxd", e))
    }

    fn receive(&mut self) -> Result<Value, Error> {
        let mut header = [0u8; MUX_HEADER_LEN];
        self.stream
            .read_exact(&mut header)
            .map_err(|e| Error::transport("usbmuxd", e))?;
        let length = decode_header(&header)?;
        let mut payload = vec![0u8; length];
        self.stream
            .read_exact(&mut payload)
            .map_err(|e| Error::transport("usbmuxd", e))?;
        Ok(Value::from_reader_xml(payload.as_slice())?)
    }

    fn request(&mut self, message: Dictionary) -> Result<Value, Error> {
        self.send(&message)?;
        self.receive()
    }

    fn into_stream(self) -> UnixStream {
        self.stream
    }
}

fn encode_header(payload_len: usize, tag: u32) -> [u8; MUX_HEADER_LEN] {
    let mut header = [0u8; MUX_HEADER_LEN];
    header[0..4].copy_from_slice(&((MUX_HEADER_LEN + payload_len) as u32).to_le_bytes());
    header[4..8].copy_from_slice(&MUX_VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&MUX_PLIST_MESSAGE.to_le_bytes());
    header[12..16].copy_from_slice(&tag.to_le_bytes());
    header
}

/// Returns the payload length announced by a mux header.
fn decode_header(header: &[u8; MUX_HEADER_LEN]) -> Result<usize, Error> {
    let length = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
    if length < MUX_HEADER_LEN {
        return Err(Error::transport("usbmuxd", "mux header announces a short message"));
    }
    Ok(length - MUX_HEADER_LEN)
}

fn control_message(message_type: &str) -> Dictionary {
    let mut message = Dictionary::new();
    message.insert("MessageType".into(), Value::String(message_type.into()));
    message.insert(
        "ClientVersionString".into(),
        Value::String(CLIENT_NAME.into()),
    );
    message.insert("ProgName".into(), Value::String(CLIENT_NAME.into()));
    message
}

fn check_result(reply: &Value) -> Result<(), Error> {
    let dict = props::as_dict(reply, "mux reply")?;
    match dict.get("Number").and_then(Value::as_unsigned_integer) {
        Some(0) => Ok(()),
        Some(code) => Err(Error::transport(
            "usbmuxd",
            format!("request refused (result {code})"),
        )),
        None => Err(Error::transport("usbmuxd", "reply carries no result code")),
    }
}

fn parse_attached(dict: &Dictionary) -> Option<DeviceEntry> {
    let properties = dict.get("Properties")?.as_dictionary()?;
    let device_id = properties.get("DeviceID")?.as_unsigned_integer()?;
    let udid = properties.get("SerialNumber")?.as_string()?.to_owned();
    Some(DeviceEntry { device_id, udid })
}

/// Asks the muxer for every attached device.
pub(crate) fn list_devices() -> Result<Vec<DeviceEntry>, Error> {
    let mut mux = MuxConnection::open()?;
    let reply = mux.request(control_message("ListDevices"))?;
    let dict = props::as_dict(&reply, "mux ListDevices reply")?;
    let list = props::dict_get(dict, "DeviceList", "mux ListDevices reply")?
        .as_array()
        .ok_or_else(|| Error::schema("`DeviceList` is not an array".to_owned()))?;

    let mut devices = Vec::new();
    for entry in list {
        if let Some(device) = entry.as_dictionary().and_then(parse_attached) {
            devices.push(device);
        }
    }
    Ok(devices)
}

/// Picks the target device: by UDID when one was requested, first
/// attached otherwise.
pub(crate) fn find_device(udid: Option<&str>) -> Result<DeviceEntry, Error> {
    let devices = list_devices()?;
    let found = match udid {
        Some(udid) => devices.into_iter().find(|d| d.udid == udid),
        None => devices.into_iter().next(),
    };
    found.ok_or(Error::DeviceAbsent)
}

/// Opens a byte pipe to a TCP port on the device. After a successful
/// `Connect` the socket stops speaking the mux protocol.
pub(crate) fn connect(device_id: u64, port: u16) -> Result<UnixStream, Error> {
    let mut mux = MuxConnection::open()?;
    let mut message = control_message("Connect");
    message.insert("DeviceID".into(), Value::Integer(device_id.into()));
    // the daemon expects the port in network byte order
    message.insert(
        "PortNumber".into(),
        Value::Integer(u64::from(port.swap_bytes()).into()),
    );
    let reply = mux.request(message)?;
    check_result(&reply)?;
    debug!("mux connection to device {device_id} port {port} established");
    let stream = mux.into_stream();
    // The upgraded pipe inherits the service's own pacing; lockdownd gets a
    // fresh timeout from its client, restored and ASR block by design.
    stream
        .set_read_timeout(None)
        .map_err(|e| Error::transport("usbmuxd", e))?;
    Ok(stream)
}

/// Starts the hotplug listener thread.
///
/// The daemon replays an `Attached` for every device already present, so a
/// subscriber never misses a device that beat it onto the bus. Events for
/// devices other than the filtered UDID are dropped here, off the
/// pipeline's thread.
pub(crate) fn listen(
    udid: Option<String>,
    observer: Box<dyn Fn(HotplugEvent) + Send>,
) -> Result<(), Error> {
    let mut mux = MuxConnection::open()?;
    let reply = mux.request(control_message("Listen"))?;
    check_result(&reply)?;

    // Hotplug events arrive whenever the device feels like it.
    mux.stream
        .set_read_timeout(None)
        .map_err(|e| Error::transport("usbmuxd", e))?;

    std::thread::Builder::new()
        .name("hotplug".into())
        .spawn(move || {
            let mut attached: HashMap<u64, String> = HashMap::new();
            loop {
                let message = match mux.receive() {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("hotplug listener stopped: {e}");
                        break;
                    }
                };
                let Some(dict) = message.as_dictionary() else {
                    continue;
                };
                match dict.get("MessageType").and_then(Value::as_string) {
                    Some("Attached") => {
                        let Some(device) = parse_attached(dict) else {
                            continue;
                        };
                        if udid.as_deref().is_some_and(|u| u != device.udid) {
                            continue;
                        }
                        debug!("device {} attached", device.udid);
                        attached.insert(device.device_id, device.udid);
                        observer(HotplugEvent::Add);
                    }
                    Some("Detached") => {
                        let device_id = dict
                            .get("DeviceID")
                            .and_then(Value::as_unsigned_integer);
                        if let Some(udid) =
                            device_id.and_then(|id| attached.remove(&id))
                        {
                            debug!("device {udid} detached");
                            observer(HotplugEvent::Remove);
                        }
                    }
                    _ => {}
                }
            }
        })
        .map_err(|e| Error::transport("usbmuxd", e))?;
    Ok(())
}

/// The length-prefixed plist framing lockdownd and restored speak: a
/// big-endian 32-bit payload length followed by an XML plist.
pub(crate) struct PlistChannel<S> {
    stream: S,
    stage: &'static str,
}

impl<S: Read + Write> PlistChannel<S> {
    pub(crate) fn new(stream: S, stage: &'static str) -> Self {
        Self { stream, stage }
    }

    pub(crate) fn send(&mut self, message: &Value) -> Result<(), Error> {
        let mut xml = Vec::new();
        message.to_writer_xml(&mut xml)?;
        self.stream
            .write_all(&(xml.len() as u32).to_be_bytes())
            .and_then(|_| self.stream.write_all(&xml))
            .map_err(|e| Error::transport(self.stage, e))
    }

    /// Reads one message; `Ok(None)` when the peer closed cleanly.
    pub(crate) fn receive(&mut self) -> Result<Option<Value>, Error> {
        let mut length = [0u8; 4];
        match self.stream.read_exact(&mut length) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::transport(self.stage, e)),
        }
        let mut payload = vec![0u8; u32::from_be_bytes(length) as usize];
        self.stream
            .read_exact(&mut payload)
            .map_err(|e| Error::transport(self.stage, e))?;
        Ok(Some(Value::from_reader_xml(payload.as_slice())?))
    }

    /// Writes bytes outside the plist framing; the ASR protocol mixes raw
    /// image data into the same stream.
    pub(crate) fn send_raw(&mut self, data: &[u8]) -> Result<(), Error> {
        self.stream
            .write_all(data)
            .map_err(|e| Error::transport(self.stage, e))
    }
}
