// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use log::{debug, info};

use crate::bundle::FirmwareBundle;
use crate::img3::Img3;
use crate::ticket::{Selector, Ticket};
use crate::Error;

/// Resolves one firmware component to the bytes the device should receive:
/// ticket lookup, bundle extraction, and signature substitution, driven by
/// either a manifest name or an archive path.
///
/// In custom mode the archive member is returned verbatim; pre-signed
/// firmware must reach the device untouched.
pub fn signed_component(
    bundle: &FirmwareBundle,
    ticket: &Ticket,
    selector: Selector,
    custom: bool,
    dump: bool,
) -> Result<Vec<u8>, Error> {
    let entry = ticket.entry(selector)?;
    info!("extracting {} from {}", entry.path, bundle.path().display());
    let data = bundle.extract_to_memory(&entry.path)?;

    let data = if custom {
        data
    } else {
        let mut img3 = Img3::parse(&data)?;
        img3.replace_signature(&entry.blob)?;
        img3.serialize()
    };

    if dump {
        dump_component(&entry.path, &data)?;
    }
    Ok(data)
}

/// Debug aid: drop the outgoing bytes in the working directory under the
/// member's basename.
fn dump_component(path: &str, data: &[u8]) -> Result<(), Error> {
    let basename = path.rsplit('/').next().unwrap_or(path);
    debug!("writing {} ({} bytes)", basename, data.len());
    std::fs::write(basename, data)
        .map_err(|e| Error::FileWriteFailed(Path::new(basename).to_owned(), e))
}
