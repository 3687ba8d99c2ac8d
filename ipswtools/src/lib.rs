// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tooling for restoring a device from an IPSW firmware bundle.
//!
//! The library is organized around the restore pipeline: [`FirmwareBundle`]
//! reads members out of the IPSW, [`tss`] obtains a per-device signing
//! ticket, [`Img3`] rewrites component signatures, the recovery uploader
//! pushes the bootchain over the recovery transport, and the restore
//! dispatcher services the device's data requests once it reboots into
//! restore mode. The device transports are consumed through the
//! [`DeviceBackend`] trait family; [`UsbBackend`] wires in working clients
//! for usbmuxd, lockdownd, restored, and the iBoot USB interface.

use std::path::PathBuf;

use thiserror::Error;

mod backend;
mod bundle;
mod component;
mod img3;
mod irecv;
mod lockdown;
mod pipeline;
mod props;
mod recovery;
mod restore;
mod restored;
mod session;
mod ticket;
mod transport;
mod usbmux;

pub mod tss;

pub use backend::UsbBackend;
pub use bundle::FirmwareBundle;
pub use component::signed_component;
pub use img3::Img3;
pub use pipeline::{run, RestoreOptions};
pub use recovery::{stdin_checkpoint, CheckpointHook};
pub use session::{Mode, SessionFlags};
pub use ticket::{Selector, SignedEntry, Ticket};
pub use transport::{
    detect, DetectedDevice, DeviceBackend, HotplugEvent, NormalPort,
    RecoveryPort, RestorePort,
};
pub use tss::SigningAuthority;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no device found in normal or recovery mode")]
    DeviceAbsent,

    #[error("unable to read the device ECID")]
    IdentityUnavailable,

    #[error("firmware bundle is missing member `{0}`")]
    ArchiveMember(String),

    #[error("could not read file `{0}`: {1}")]
    FileReadFailed(PathBuf, std::io::Error),

    #[error("could not write file `{0}`: {1}")]
    FileWriteFailed(PathBuf, std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("property list error: {0}")]
    Plist(#[from] plist::Error),

    #[error("unexpected property list shape: {0}")]
    SchemaViolation(String),

    #[error("signing authority unavailable: {0}")]
    SigningUnavailable(String),

    #[error("ticket has no entry named `{0}`")]
    TicketEntryMissing(String),

    #[error("ticket has no entry with path `{0}`")]
    TicketPathMissing(String),

    #[error("malformed ticket entry `{0}`: {1}")]
    TicketEntryMalformed(String, &'static str),

    #[error("malformed IMG3 container: {0}")]
    ContainerMalformed(&'static str),

    #[error("container has no signature chunk")]
    NoSignatureChunk,

    #[error("transport failure during {stage}: {message}")]
    TransportFailure {
        stage: &'static str,
        message: String,
    },

    #[error("device refused the restore handshake (QueryType returned `{0}`)")]
    NotInRestoreMode(String),

    #[error("restore agent requested unserviceable data type `{0}`")]
    UnknownDataType(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps a transport-level failure with the pipeline stage it occurred
    /// in, so the operator can tell an upload failure from a mux failure.
    pub fn transport<E: std::fmt::Display>(stage: &'static str, err: E) -> Self {
        Error::TransportFailure {
            stage,
            message: err.to_string(),
        }
    }

    fn schema<C: Into<String>>(context: C) -> Self {
        Error::SchemaViolation(context.into())
    }
}
