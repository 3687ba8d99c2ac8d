// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! lockdownd: the normal-mode query service.
//!
//! The restore pipeline needs exactly two things from it: the device's
//! `UniqueChipID` and the `EnterRecovery` command.

use std::os::unix::net::UnixStream;

use log::debug;
use plist::{Dictionary, Value};

use crate::transport::NormalPort;
use crate::usbmux::{self, PlistChannel};
use crate::{props, Error};

const LOCKDOWN_PORT: u16 = 62078;
const SERVICE_TYPE: &str = "com.apple.mobile.lockdown";
const LABEL: &str = "idevrestore";

/// lockdownd answers queries promptly; a stalled read means the session is
/// gone, not that the device is thinking.
const REPLY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

pub struct LockdownClient {
    channel: PlistChannel<UnixStream>,
}

impl LockdownClient {
    /// Connects through the muxer and verifies the peer is lockdownd.
    pub fn connect(device_id: u64) -> Result<Self, Error> {
        let stream = usbmux::connect(device_id, LOCKDOWN_PORT)?;
        stream
            .set_read_timeout(Some(REPLY_TIMEOUT))
            .map_err(|e| Error::transport("lockdown", e))?;
        let mut client = Self {
            channel: PlistChannel::new(stream, "lockdown"),
        };
        let kind = client.query_type()?;
        if kind != SERVICE_TYPE {
            return Err(Error::transport(
                "lockdown",
                format!("unexpected service type `{kind}`"),
            ));
        }
        Ok(client)
    }

    fn request(
        &mut self,
        request: &str,
        extra: &[(&str, Value)],
    ) -> Result<Dictionary, Error> {
        let mut message = Dictionary::new();
        message.insert("Label".into(), Value::String(LABEL.into()));
        message.insert("Request".into(), Value::String(request.into()));
        for (key, value) in extra {
            message.insert((*key).into(), value.clone());
        }
        self.channel.send(&Value::Dictionary(message))?;

        let reply = self
            .channel
            .receive()?
            .ok_or_else(|| Error::transport("lockdown", "connection closed"))?;
        let reply = props::as_dict(&reply, "lockdown reply")?.clone();
        if let Some(error) = reply.get("Error").and_then(Value::as_string) {
            return Err(Error::transport(
                "lockdown",
                format!("{request} failed: {error}"),
            ));
        }
        Ok(reply)
    }

    fn query_type(&mut self) -> Result<String, Error> {
        let reply = self.request("QueryType", &[])?;
        Ok(props::as_string(
            props::dict_get(&reply, "Type", "lockdown QueryType reply")?,
            "lockdown QueryType `Type`",
        )?
        .to_owned())
    }

    fn get_value(&mut self, key: &str) -> Result<Value, Error> {
        let reply =
            self.request("GetValue", &[("Key", Value::String(key.into()))])?;
        reply
            .get("Value")
            .cloned()
            .ok_or_else(|| Error::transport("lockdown", format!("no value for {key}")))
    }
}

impl NormalPort for LockdownClient {
    fn unique_chip_id(&mut self) -> Result<u64, Error> {
        let value = self
            .get_value("UniqueChipID")
            .map_err(|_| Error::IdentityUnavailable)?;
        let ecid = value
            .as_unsigned_integer()
            .ok_or(Error::IdentityUnavailable)?;
        debug!("UniqueChipID = {ecid:#x}");
        Ok(ecid)
    }

    fn enter_recovery(&mut self) -> Result<(), Error> {
        self.request("EnterRecovery", &[]).map(|_| ())
    }
}
