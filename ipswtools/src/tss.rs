// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The TSS signing-authority client.
//!
//! A request is the build manifest's component entries bound to one device
//! by its ECID; the response is the [`Ticket`](crate::Ticket) carrying a
//! signature blob per component. The exchange is idempotent: the authority
//! answers the same `(manifest, ECID)` pair with the same ticket, so a
//! failed attempt can simply be run again by the operator.

use plist::{Dictionary, Value};

use crate::{props, ticket, Error, Ticket};

const CONTROLLER_URL: &str = "https://gs.apple.com/TSS/controller?action=2";
const VERSION_INFO: &str = "libauthinstall-107.3";

/// The exchange half of the client, as a seam so the pipeline can be run
/// against a scripted authority.
pub trait SigningAuthority {
    fn exchange(&self, request: &Dictionary) -> Result<Ticket, Error>;
}

/// The production client, speaking HTTPS to the TSS controller.
pub struct TssClient {
    url: String,
}

impl TssClient {
    pub fn new() -> Self {
        Self {
            url: CONTROLLER_URL.to_owned(),
        }
    }

    pub fn with_url<S: Into<String>>(url: S) -> Self {
        Self { url: url.into() }
    }
}

impl Default for TssClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SigningAuthority for TssClient {
    fn exchange(&self, request: &Dictionary) -> Result<Ticket, Error> {
        let mut body = Vec::new();
        Value::Dictionary(request.clone())
            .to_writer_xml(&mut body)
            .map_err(|e| Error::SigningUnavailable(format!("request encoding: {e}")))?;
        let body = String::from_utf8(body)
            .map_err(|e| Error::SigningUnavailable(format!("request encoding: {e}")))?;

        let response = ureq::post(&self.url)
            .set("Cache-Control", "no-cache")
            .set("Content-Type", "text/xml; charset=\"utf-8\"")
            .set("User-Agent", "InetURL/1.0")
            .send_string(&body)
            .map_err(|e| Error::SigningUnavailable(e.to_string()))?;
        let body = response
            .into_string()
            .map_err(|e| Error::SigningUnavailable(format!("reading response: {e}")))?;

        let value = parse_response_body(&body)?;
        Ticket::from_value(value, "TSS response")
    }
}

/// Builds the signing request for `manifest` bound to the device `ecid`.
///
/// The component entries are copied verbatim from the first build identity,
/// which is what carries `OS.Info.Path` through to the response.
pub fn build_request(manifest: &Value, ecid: u64) -> Result<Dictionary, Error> {
    let root = props::as_dict(manifest, "build manifest")?;
    let identities = props::dict_get(root, "BuildIdentities", "build manifest")?
        .as_array()
        .ok_or_else(|| Error::schema("`BuildIdentities` is not an array".to_owned()))?;
    let identity = props::as_dict(
        identities
            .first()
            .ok_or_else(|| Error::schema("`BuildIdentities` is empty".to_owned()))?,
        "build identity",
    )?;

    let mut request = Dictionary::new();
    request.insert("@HostIpAddress".into(), Value::String("192.168.0.1".into()));
    request.insert("@HostPlatformInfo".into(), Value::String("darwin".into()));
    request.insert("@VersionInfo".into(), Value::String(VERSION_INFO.into()));
    // A deterministic session identifier keeps the request, and therefore
    // the authority's answer, stable across retries for one device.
    request.insert("@UUID".into(), Value::String(session_uuid(ecid)));

    for key in ["ApBoardID", "ApChipID", "ApSecurityDomain", "UniqueBuildID"] {
        let node = props::dict_get(identity, key, "build identity")?;
        request.insert(key.into(), node.clone());
    }
    request.insert("ApECID".into(), Value::Integer(ecid.into()));
    request.insert("ApProductionMode".into(), Value::Boolean(true));

    let components = props::as_dict(
        props::dict_get(identity, "Manifest", "build identity")?,
        "build identity `Manifest`",
    )?;
    for (name, node) in props::entries(components) {
        request.insert(name.to_owned(), node.clone());
    }

    Ok(request)
}

/// Reads `OS.Info.Path` out of a built request, locating the filesystem
/// image inside the bundle. The response carries the identical subtree.
pub fn os_image_path(request: &Dictionary) -> Result<String, Error> {
    ticket::os_image_path(request, "TSS request")
}

fn session_uuid(ecid: u64) -> String {
    let hi = (ecid >> 32) as u32;
    let lo = ecid as u32;
    format!(
        "{:08X}-{:04X}-{:04X}-{:04X}-{:08X}{:04X}",
        hi,
        (lo >> 16) as u16,
        lo as u16,
        (hi >> 16) as u16,
        lo,
        hi as u16
    )
}

/// The controller wraps its answer in a form-encoded status line; the
/// ticket plist rides behind `REQUEST_STRING=`.
fn parse_response_body(body: &str) -> Result<Value, Error> {
    if body.is_empty() {
        return Err(Error::SigningUnavailable("empty response body".to_owned()));
    }
    if !body.contains("MESSAGE=SUCCESS") {
        let status = body.lines().next().unwrap_or("").trim();
        return Err(Error::SigningUnavailable(format!(
            "authority rejected the request: {status}"
        )));
    }
    let xml = body
        .split_once("REQUEST_STRING=")
        .map(|(_, xml)| xml)
        .ok_or_else(|| {
            Error::SigningUnavailable("response carries no ticket".to_owned())
        })?;
    Value::from_reader_xml(xml.as_bytes())
        .map_err(|e| Error::SigningUnavailable(format!("malformed ticket plist: {e}")))
}
