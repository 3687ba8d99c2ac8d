// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The restore pipeline, end to end.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use plist::Value;

use crate::bundle::FirmwareBundle;
use crate::recovery::{self, stdin_checkpoint, CheckpointHook};
use crate::restore::Dispatcher;
use crate::session::{Mode, SessionFlags};
use crate::transport::{
    detect, DetectedDevice, DeviceBackend, NormalPort, RecoveryPort,
};
use crate::tss::{self, SigningAuthority};
use crate::Error;

/// After the recovery command or a bootchain handoff the device drops off
/// the bus for a moment; give it this many one-second chances to return.
const RECOVERY_REOPEN_ATTEMPTS: usize = 10;

pub struct RestoreOptions {
    /// Push archive members verbatim instead of substituting signatures.
    pub custom: bool,
    /// Write each outgoing component to the working directory.
    pub dump_components: bool,
    /// The operator pause between ramdisk and kernelcache.
    pub checkpoint: CheckpointHook,
}

impl RestoreOptions {
    pub fn new() -> Self {
        Self {
            custom: false,
            dump_components: false,
            checkpoint: stdin_checkpoint(),
        }
    }
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the whole restore: detect, sign, extract, bootchain, restore loop.
///
/// The extracted filesystem image is unlinked on the way out unless the
/// pipeline failed after the device reached restore mode, in which case it
/// stays behind for the operator's next attempt.
pub fn run(
    backend: &mut dyn DeviceBackend,
    bundle: &FirmwareBundle,
    signer: &dyn SigningAuthority,
    mut opts: RestoreOptions,
) -> Result<(), Error> {
    let flags = Arc::new(SessionFlags::new());
    let mut filesystem: Option<PathBuf> = None;

    let result = drive(backend, bundle, signer, &mut opts, &flags, &mut filesystem);

    if let Some(path) = filesystem {
        let keep = result.is_err() && flags.mode() == Mode::Restore;
        if keep {
            info!("leaving filesystem image at {}", path.display());
        } else if let Err(e) = std::fs::remove_file(&path) {
            warn!("could not remove {}: {e}", path.display());
        }
    }
    result
}

fn drive(
    backend: &mut dyn DeviceBackend,
    bundle: &FirmwareBundle,
    signer: &dyn SigningAuthority,
    opts: &mut RestoreOptions,
    flags: &Arc<SessionFlags>,
    filesystem: &mut Option<PathBuf>,
) -> Result<(), Error> {
    let ecid = match detect(backend)? {
        DetectedDevice::Normal(mut port) => {
            info!("found device in normal mode");
            flags.promote(Mode::Normal);
            port.unique_chip_id()?
        }
        DetectedDevice::Recovery(mut port) => {
            info!("found device in recovery mode");
            flags.promote(Mode::Recovery);
            port.ecid()?
        }
    };
    if ecid == 0 {
        return Err(Error::IdentityUnavailable);
    }
    info!("found ECID {ecid}");

    info!("extracting BuildManifest.plist from the bundle");
    let manifest_bytes = bundle.extract_to_memory("BuildManifest.plist")?;
    let manifest = Value::from_reader_xml(manifest_bytes.as_slice())?;

    info!("requesting signing ticket");
    let request = tss::build_request(&manifest, ecid)?;
    let ticket = signer.exchange(&request)?;
    info!("got signing ticket");

    let image_member = tss::os_image_path(&request)?;
    let image_path = PathBuf::from(&image_member);
    info!("extracting filesystem image to {}", image_path.display());
    bundle.extract_to_file(&image_member, &image_path)?;
    *filesystem = Some(image_path.clone());

    if flags.mode() == Mode::Normal {
        info!("telling the device to enter recovery mode");
        let mut port = backend.open_normal()?;
        port.enter_recovery()?;
        flags.promote(Mode::Recovery);
    }

    let mut recovery_port = open_recovery(backend)?;
    recovery::send_bootchain(
        recovery_port.as_mut(),
        bundle,
        &ticket,
        opts.custom,
        opts.dump_components,
        &mut opts.checkpoint,
    )?;
    drop(recovery_port);

    // Subscribe only now: during the bootchain the device re-enumerates in
    // recovery mode, and that add event must not count as restore mode.
    // The mux replays attach events on subscription, so a device that beat
    // us into restore mode is still observed.
    backend.subscribe(flags.observer())?;

    info!("waiting for device to enter restore mode");
    while flags.mode() != Mode::Restore {
        if flags.quit() {
            info!("device removed before entering restore mode");
            return Err(Error::DeviceAbsent);
        }
        thread::sleep(Duration::from_secs(1));
    }

    let mut restore_port = backend.open_restore()?;
    let mut dispatcher = Dispatcher::new(
        restore_port.as_mut(),
        bundle,
        &ticket,
        Arc::clone(flags),
        &image_path,
        opts.custom,
        opts.dump_components,
    );
    dispatcher.run()
}

/// Reopens the recovery transport, tolerating the re-enumeration window.
fn open_recovery(
    backend: &mut dyn DeviceBackend,
) -> Result<Box<dyn RecoveryPort>, Error> {
    let mut attempt = 0;
    loop {
        match backend.open_recovery() {
            Ok(port) => return Ok(port),
            Err(e) if attempt + 1 < RECOVERY_REOPEN_ATTEMPTS => {
                attempt += 1;
                debug!("recovery transport not up yet (attempt {attempt}): {e}");
                thread::sleep(Duration::from_secs(1));
            }
            Err(e) => return Err(e),
        }
    }
}

// The scenario tests drive the pipeline against a scripted bus that mimics
// the mux daemon's behavior, including attach-event replay on subscribe.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::testutil::build_zip;
    use crate::img3::testutil::build_container;
    use crate::ticket::testutil::{os_entry, signed_entry};
    use crate::transport::{HotplugEvent, RestorePort};
    use crate::tss::testutil::manifest;
    use crate::Ticket;
    use plist::Dictionary;
    use std::collections::VecDeque;
    use std::io::Write;
    use std::path::Path;
    use std::sync::Mutex;

    const ECID: u64 = 0x0123_4567_89AB_CDEF;
    const BOOTCHAIN: [&str; 5] = ["iBEC", "AppleLogo", "DeviceTree", "Ramdisk", "KernelCache"];

    #[derive(Default)]
    struct Bus {
        observer: Option<Box<dyn Fn(HotplugEvent) + Send>>,
        pending: Vec<HotplugEvent>,
        /// Event delivered once the kernelcache boots.
        on_bootx: Option<HotplugEvent>,
        commands: Vec<String>,
        uploads: Vec<Vec<u8>>,
        entered_recovery: bool,
        streamed: Vec<PathBuf>,
        replies: Vec<Value>,
        restore_opened: bool,
    }

    impl Bus {
        fn fire(&mut self, event: HotplugEvent) {
            match &self.observer {
                Some(observer) => observer(event),
                None => self.pending.push(event),
            }
        }
    }

    struct MockBackend {
        bus: Arc<Mutex<Bus>>,
        starts_in_normal: bool,
        restore_script: Vec<Value>,
    }

    impl MockBackend {
        fn new(starts_in_normal: bool) -> Self {
            let bus = Bus {
                on_bootx: Some(HotplugEvent::Add),
                ..Bus::default()
            };
            Self {
                bus: Arc::new(Mutex::new(bus)),
                starts_in_normal,
                restore_script: Vec::new(),
            }
        }

        fn set_on_bootx(&mut self, event: HotplugEvent) {
            self.bus.lock().unwrap().on_bootx = Some(event);
        }
    }

    struct MockNormalPort {
        bus: Arc<Mutex<Bus>>,
    }

    impl NormalPort for MockNormalPort {
        fn unique_chip_id(&mut self) -> Result<u64, Error> {
            Ok(ECID)
        }

        fn enter_recovery(&mut self) -> Result<(), Error> {
            self.bus.lock().unwrap().entered_recovery = true;
            Ok(())
        }
    }

    struct MockRecoveryPort {
        bus: Arc<Mutex<Bus>>,
    }

    impl RecoveryPort for MockRecoveryPort {
        fn ecid(&mut self) -> Result<u64, Error> {
            Ok(ECID)
        }

        fn upload_file(&mut self, data: &[u8]) -> Result<(), Error> {
            self.bus.lock().unwrap().uploads.push(data.to_vec());
            Ok(())
        }

        fn run_command(&mut self, command: &str) -> Result<(), Error> {
            let mut bus = self.bus.lock().unwrap();
            bus.commands.push(command.to_owned());
            if command == "bootx" {
                if let Some(event) = bus.on_bootx.take() {
                    bus.fire(event);
                }
            }
            Ok(())
        }
    }

    struct MockRestorePort {
        bus: Arc<Mutex<Bus>>,
        script: VecDeque<Value>,
    }

    impl RestorePort for MockRestorePort {
        fn query_type(&mut self) -> Result<String, Error> {
            Ok("com.apple.mobile.restored".to_owned())
        }

        fn start_restore(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn receive(&mut self) -> Result<Option<Value>, Error> {
            Ok(self.script.pop_front())
        }

        fn send(&mut self, message: Value) -> Result<(), Error> {
            self.bus.lock().unwrap().replies.push(message);
            Ok(())
        }

        fn stream_image(&mut self, image: &Path) -> Result<(), Error> {
            self.bus.lock().unwrap().streamed.push(image.to_owned());
            Ok(())
        }
    }

    impl DeviceBackend for MockBackend {
        fn open_normal(&mut self) -> Result<Box<dyn NormalPort>, Error> {
            if !self.starts_in_normal {
                return Err(Error::transport("lockdown", "no normal-mode device"));
            }
            Ok(Box::new(MockNormalPort {
                bus: Arc::clone(&self.bus),
            }))
        }

        fn open_recovery(&mut self) -> Result<Box<dyn RecoveryPort>, Error> {
            Ok(Box::new(MockRecoveryPort {
                bus: Arc::clone(&self.bus),
            }))
        }

        fn open_restore(&mut self) -> Result<Box<dyn RestorePort>, Error> {
            self.bus.lock().unwrap().restore_opened = true;
            Ok(Box::new(MockRestorePort {
                bus: Arc::clone(&self.bus),
                script: std::mem::take(&mut self.restore_script).into(),
            }))
        }

        fn subscribe(
            &mut self,
            observer: Box<dyn Fn(HotplugEvent) + Send>,
        ) -> Result<(), Error> {
            let mut bus = self.bus.lock().unwrap();
            for event in bus.pending.drain(..) {
                observer(event);
            }
            bus.observer = Some(observer);
            Ok(())
        }
    }

    struct ScriptedSigner {
        ticket: Ticket,
    }

    impl SigningAuthority for ScriptedSigner {
        fn exchange(&self, request: &Dictionary) -> Result<Ticket, Error> {
            // the authority echoes OS.Info.Path; the scripted ticket was
            // built from the same member name
            assert!(request.contains_key("OS"));
            assert!(request.contains_key("ApECID"));
            Ok(self.ticket.clone())
        }
    }

    struct OutageSigner;

    impl SigningAuthority for OutageSigner {
        fn exchange(&self, _request: &Dictionary) -> Result<Ticket, Error> {
            Err(Error::SigningUnavailable("empty response body".to_owned()))
        }
    }

    struct Fixture {
        _file: tempfile::NamedTempFile,
        bundle: FirmwareBundle,
        ticket: Ticket,
        image: PathBuf,
        container: Vec<u8>,
    }

    fn fixture(image_member: &str) -> Fixture {
        let container =
            build_container(*b"test", &[(*b"DATA", b"firmware"), (*b"SHSH", &[0; 12])]);

        let mut manifest_xml = Vec::new();
        manifest(&[("OS", os_entry(image_member))])
            .to_writer_xml(&mut manifest_xml)
            .unwrap();

        let mut members: Vec<(String, Vec<u8>)> = vec![
            ("BuildManifest.plist".to_owned(), manifest_xml),
            (image_member.to_owned(), b"root filesystem".to_vec()),
            (
                "Firmware/all_flash/LLB.m68ap.img3".to_owned(),
                container.clone(),
            ),
            (
                "Firmware/all_flash/applelogo.img3".to_owned(),
                container.clone(),
            ),
        ];
        for name in BOOTCHAIN {
            members.push((format!("Firmware/{name}.img3"), container.clone()));
        }
        let borrowed: Vec<(&str, &[u8])> = members
            .iter()
            .map(|(n, d)| (n.as_str(), d.as_slice()))
            .collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&build_zip(&borrowed)).unwrap();
        file.flush().unwrap();
        let bundle = FirmwareBundle::open(file.path()).unwrap();

        let mut root = Dictionary::new();
        root.insert("OS".into(), os_entry(image_member));
        for name in BOOTCHAIN {
            root.insert(
                name.into(),
                signed_entry(&format!("Firmware/{name}.img3"), &[7; 16]),
            );
        }
        root.insert(
            "LLB".into(),
            signed_entry("Firmware/all_flash/LLB.m68ap.img3", &[8; 16]),
        );
        root.insert(
            "AppleLogo2".into(),
            signed_entry("Firmware/all_flash/applelogo.img3", &[9; 16]),
        );
        let ticket = Ticket::from_value(Value::Dictionary(root), "test").unwrap();

        Fixture {
            _file: file,
            bundle,
            ticket,
            image: PathBuf::from(image_member),
            container,
        }
    }

    fn happy_script() -> Vec<Value> {
        fn msg(entries: &[(&str, Value)]) -> Value {
            let mut dict = Dictionary::new();
            for (key, value) in entries {
                dict.insert((*key).into(), value.clone());
            }
            Value::Dictionary(dict)
        }
        vec![
            msg(&[
                ("MsgType", Value::String("ProgressMsg".into())),
                ("Operation", Value::Integer(1u64.into())),
                ("Progress", Value::Integer(25u64.into())),
            ]),
            msg(&[
                ("MsgType", Value::String("DataRequestMsg".into())),
                ("DataType", Value::String("SystemImageData".into())),
            ]),
            msg(&[
                ("MsgType", Value::String("DataRequestMsg".into())),
                ("DataType", Value::String("KernelCache".into())),
            ]),
            msg(&[
                ("MsgType", Value::String("DataRequestMsg".into())),
                ("DataType", Value::String("NORData".into())),
            ]),
            msg(&[
                ("MsgType", Value::String("StatusMsg".into())),
                ("Status", Value::Integer(0u64.into())),
            ]),
        ]
    }

    fn quiet_options() -> RestoreOptions {
        RestoreOptions {
            custom: false,
            dump_components: false,
            checkpoint: Box::new(|| Ok(())),
        }
    }

    #[test]
    fn s1_happy_path_from_normal_mode() {
        let fixture = fixture("pipeline-s1.dmg");
        let mut backend = MockBackend::new(true);
        backend.restore_script = happy_script();
        let signer = ScriptedSigner {
            ticket: fixture.ticket.clone(),
        };

        run(&mut backend, &fixture.bundle, &signer, quiet_options()).unwrap();

        let bus = backend.bus.lock().unwrap();
        assert!(bus.entered_recovery);
        assert_eq!(bus.uploads.len(), BOOTCHAIN.len());
        assert_eq!(
            bus.commands,
            [
                "setenv auto-boot true",
                "saveenv",
                "go",
                "setpicture",
                "devicetree",
                "ramdisk",
                "bootx"
            ]
        );
        assert_eq!(bus.streamed, vec![fixture.image.clone()]);
        assert_eq!(bus.replies.len(), 2);
        assert!(
            !fixture.image.exists(),
            "filesystem image must be unlinked on clean exit"
        );
    }

    #[test]
    fn s2_recovery_start_skips_the_normal_transition() {
        let fixture = fixture("pipeline-s2.dmg");
        let mut backend = MockBackend::new(false);
        backend.restore_script = happy_script();
        let signer = ScriptedSigner {
            ticket: fixture.ticket.clone(),
        };

        run(&mut backend, &fixture.bundle, &signer, quiet_options()).unwrap();

        let bus = backend.bus.lock().unwrap();
        assert!(!bus.entered_recovery);
        assert_eq!(bus.uploads.len(), BOOTCHAIN.len());
        assert!(!fixture.image.exists());
    }

    #[test]
    fn s3_signing_outage_fails_before_any_extraction() {
        let fixture = fixture("pipeline-s3.dmg");
        let mut backend = MockBackend::new(true);

        let result = run(
            &mut backend,
            &fixture.bundle,
            &OutageSigner,
            quiet_options(),
        );

        assert!(matches!(result, Err(Error::SigningUnavailable(_))));
        assert!(
            !fixture.image.exists(),
            "nothing may be written to disk when signing fails"
        );
        let bus = backend.bus.lock().unwrap();
        assert!(bus.uploads.is_empty());
    }

    #[test]
    fn s4_custom_mode_pushes_members_verbatim() {
        let fixture = fixture("pipeline-s4.dmg");
        let mut backend = MockBackend::new(true);
        backend.restore_script = happy_script();
        let signer = ScriptedSigner {
            ticket: fixture.ticket.clone(),
        };
        let mut opts = quiet_options();
        opts.custom = true;

        run(&mut backend, &fixture.bundle, &signer, opts).unwrap();

        let bus = backend.bus.lock().unwrap();
        for upload in &bus.uploads {
            assert_eq!(upload, &fixture.container);
        }
        // the kernelcache served over the restore channel is verbatim too
        let kc = bus.replies[0].as_dictionary().unwrap();
        assert_eq!(
            kc.get("KernelCacheFile").unwrap().as_data().unwrap(),
            fixture.container.as_slice()
        );
    }

    #[test]
    fn s5_unknown_data_type_keeps_the_image_for_a_retry() {
        let fixture = fixture("pipeline-s5.dmg");
        let mut backend = MockBackend::new(true);
        let mut dict = Dictionary::new();
        dict.insert("MsgType".into(), Value::String("DataRequestMsg".into()));
        dict.insert("DataType".into(), Value::String("Unicorn".into()));
        backend.restore_script = vec![Value::Dictionary(dict)];
        let signer = ScriptedSigner {
            ticket: fixture.ticket.clone(),
        };

        let result = run(&mut backend, &fixture.bundle, &signer, quiet_options());

        assert!(matches!(result, Err(Error::UnknownDataType(_))));
        // the device was already in restore mode, so the extracted image
        // survives for the operator's next attempt
        assert!(fixture.image.exists());
        std::fs::remove_file(&fixture.image).unwrap();
    }

    #[test]
    fn s6_removal_during_the_restore_wait_exits_cleanly() {
        let fixture = fixture("pipeline-s6.dmg");
        let mut backend = MockBackend::new(true);
        backend.set_on_bootx(HotplugEvent::Remove);
        let signer = ScriptedSigner {
            ticket: fixture.ticket.clone(),
        };

        let result = run(&mut backend, &fixture.bundle, &signer, quiet_options());

        assert!(matches!(result, Err(Error::DeviceAbsent)));
        let bus = backend.bus.lock().unwrap();
        assert!(
            !bus.restore_opened,
            "no restore client may be opened after a remove event"
        );
        assert!(!fixture.image.exists());
    }

    #[test]
    fn checkpoint_hook_fires_once_per_restore() {
        let fixture = fixture("pipeline-checkpoint.dmg");
        let mut backend = MockBackend::new(true);
        backend.restore_script = happy_script();
        let signer = ScriptedSigner {
            ticket: fixture.ticket.clone(),
        };
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_in_hook = Arc::clone(&count);
        let opts = RestoreOptions {
            custom: false,
            dump_components: false,
            checkpoint: Box::new(move || {
                count_in_hook.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }),
        };

        run(&mut backend, &fixture.bundle, &signer, opts).unwrap();
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
