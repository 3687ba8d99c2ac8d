// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! restored: the restore-mode agent's message channel, plus the ASR
//! connection it hands the filesystem image to.
//!
//! In restore mode the device keeps the lockdown port but a different
//! service answers on it; the framing is identical. ASR listens on its own
//! port and interleaves raw image bytes with the plist framing.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::net::UnixStream;
use std::path::Path;

use log::{debug, info};
use plist::{Dictionary, Value};

use crate::transport::RestorePort;
use crate::usbmux::{self, PlistChannel};
use crate::{props, Error};

const RESTORED_PORT: u16 = 62078;
const LABEL: &str = "idevrestore";

const ASR_PORT: u16 = 12345;
const ASR_PAYLOAD_CHUNK: usize = 1450;
const ASR_FEC_SLICE_STRIDE: u64 = 40;
const ASR_PACKETS_PER_FEC: u64 = 25;

pub struct RestoredClient {
    channel: PlistChannel<UnixStream>,
    device_id: u64,
}

impl RestoredClient {
    pub fn connect(device_id: u64) -> Result<Self, Error> {
        let stream = usbmux::connect(device_id, RESTORED_PORT)?;
        Ok(Self {
            channel: PlistChannel::new(stream, "restored"),
            device_id,
        })
    }
}

impl RestorePort for RestoredClient {
    fn query_type(&mut self) -> Result<String, Error> {
        let mut message = Dictionary::new();
        message.insert("Request".into(), Value::String("QueryType".into()));
        message.insert("Label".into(), Value::String(LABEL.into()));
        self.channel.send(&Value::Dictionary(message))?;

        let reply = self
            .channel
            .receive()?
            .ok_or_else(|| Error::transport("restored", "connection closed"))?;
        let reply = props::as_dict(&reply, "restored QueryType reply")?;
        if let Some(version) = reply
            .get("RestoreProtocolVersion")
            .and_then(Value::as_unsigned_integer)
        {
            info!("restore protocol version is {version}");
        }
        Ok(props::as_string(
            props::dict_get(reply, "Type", "restored QueryType reply")?,
            "restored QueryType `Type`",
        )?
        .to_owned())
    }

    fn start_restore(&mut self) -> Result<(), Error> {
        let mut message = Dictionary::new();
        message.insert("Request".into(), Value::String("StartRestore".into()));
        message.insert("Label".into(), Value::String(LABEL.into()));
        self.channel.send(&Value::Dictionary(message))
    }

    fn receive(&mut self) -> Result<Option<Value>, Error> {
        self.channel.receive()
    }

    fn send(&mut self, message: Value) -> Result<(), Error> {
        self.channel.send(&message)
    }

    fn stream_image(&mut self, image: &Path) -> Result<(), Error> {
        stream_image(self.device_id, image)
    }
}

/// Feeds the filesystem image to the device's ASR agent: announce the
/// stream, answer out-of-band reads (ASR validates pieces of the image
/// before committing), then pump the payload.
fn stream_image(device_id: u64, image: &Path) -> Result<(), Error> {
    let mut file = File::open(image)
        .map_err(|e| Error::FileReadFailed(image.to_owned(), e))?;
    let size = file
        .metadata()
        .map_err(|e| Error::FileReadFailed(image.to_owned(), e))?
        .len();

    let stream = usbmux::connect(device_id, ASR_PORT)?;
    let mut channel = PlistChannel::new(stream, "asr");

    let mut payload = Dictionary::new();
    payload.insert("Port".into(), Value::Integer(1u64.into()));
    payload.insert("Size".into(), Value::Integer(size.into()));
    let mut initiate = Dictionary::new();
    initiate.insert(
        "FEC Slice Stride".into(),
        Value::Integer(ASR_FEC_SLICE_STRIDE.into()),
    );
    initiate.insert(
        "Packet Payload Size".into(),
        Value::Integer((ASR_PAYLOAD_CHUNK as u64).into()),
    );
    initiate.insert(
        "Packets Per FEC".into(),
        Value::Integer(ASR_PACKETS_PER_FEC.into()),
    );
    initiate.insert("Payload".into(), Value::Dictionary(payload));
    initiate.insert("Stream ID".into(), Value::Integer(1u64.into()));
    initiate.insert("Version".into(), Value::Integer(1u64.into()));
    channel.send(&Value::Dictionary(initiate))?;

    loop {
        let message = channel
            .receive()?
            .ok_or_else(|| Error::transport("asr", "connection closed"))?;
        let dict = props::as_dict(&message, "asr message")?;
        match dict.get("Command").and_then(Value::as_string) {
            Some("OOBData") => {
                let offset = props::as_u64(
                    props::dict_get(dict, "OOB Offset", "asr OOBData")?,
                    "asr `OOB Offset`",
                )?;
                let length = props::as_u64(
                    props::dict_get(dict, "OOB Length", "asr OOBData")?,
                    "asr `OOB Length`",
                )?;
                debug!("asr out-of-band read: {length} bytes at {offset}");
                let mut buffer = vec![0u8; length as usize];
                file.seek(SeekFrom::Start(offset))
                    .and_then(|_| file.read_exact(&mut buffer))
                    .map_err(|e| Error::FileReadFailed(image.to_owned(), e))?;
                channel.send_raw(&buffer)?;
            }
            Some("Payload") => break,
            Some(other) => debug!("asr: ignoring command {other}"),
            None => debug!("asr: message without a command"),
        }
    }

    file.seek(SeekFrom::Start(0))
        .map_err(|e| Error::FileReadFailed(image.to_owned(), e))?;
    let mut chunk = vec![0u8; ASR_PAYLOAD_CHUNK];
    let mut sent: u64 = 0;
    loop {
        let n = file
            .read(&mut chunk)
            .map_err(|e| Error::FileReadFailed(image.to_owned(), e))?;
        if n == 0 {
            break;
        }
        channel.send_raw(&chunk[..n])?;
        sent += n as u64;
    }
    info!("filesystem image streamed ({sent} of {size} bytes)");
    Ok(())
}
