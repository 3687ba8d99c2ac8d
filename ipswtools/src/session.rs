// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::transport::HotplugEvent;

/// The device's operational mode as the pipeline understands it.
///
/// Modes are ordered: a session only ever moves forward, from `Unknown`
/// through `Normal` (possibly skipped) and `Recovery` to `Restore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Mode {
    Unknown = 0,
    Normal = 1,
    Recovery = 2,
    Restore = 3,
}

impl Mode {
    fn from_u8(raw: u8) -> Mode {
        match raw {
            1 => Mode::Normal,
            2 => Mode::Recovery,
            3 => Mode::Restore,
            _ => Mode::Unknown,
        }
    }
}

/// The two words of session state shared with the hotplug observer.
///
/// The observer thread only promotes the mode forward and latches `quit`;
/// the pipeline polls both. Nothing else crosses threads.
#[derive(Debug)]
pub struct SessionFlags {
    mode: AtomicU8,
    quit: AtomicBool,
}

impl SessionFlags {
    pub fn new() -> Self {
        Self {
            mode: AtomicU8::new(Mode::Unknown as u8),
            quit: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> Mode {
        Mode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    /// Moves the mode forward to `to`. A promotion that would move the mode
    /// backward is ignored, which keeps the observed mode monotonic no
    /// matter how callbacks and pipeline steps interleave.
    pub fn promote(&self, to: Mode) -> bool {
        let mut current = self.mode.load(Ordering::SeqCst);
        loop {
            if current >= to as u8 {
                return false;
            }
            match self.mode.compare_exchange(
                current,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    debug!("session mode is now {to:?}");
                    return true;
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    pub fn latch_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    /// The hotplug observer: an add event means the device re-enumerated in
    /// restore mode, a remove event ends the session. No other state may be
    /// touched from the callback context.
    pub fn observer(self: &Arc<Self>) -> Box<dyn Fn(HotplugEvent) + Send> {
        let flags = Arc::clone(self);
        Box::new(move |event| match event {
            HotplugEvent::Add => {
                flags.promote(Mode::Restore);
            }
            HotplugEvent::Remove => {
                info!("device removed");
                flags.latch_quit();
            }
        })
    }
}

impl Default for SessionFlags {
    fn default() -> Self {
        Self::new()
    }
}
