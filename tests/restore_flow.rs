//! End-to-end restore flow, exercising the Orchestrator against fake
//! collaborators standing in for USB, HTTP, and archive I/O.

use futurerestore_core::device::{DeviceSession, Mode};
use futurerestore_core::external::{ArchiveReader, BootloaderPatcher, DownloadTransport, RestoreEngine, UsbEvent, UsbTransport};
use futurerestore_core::firmware_index::{FirmwareIndex, Selector};
use futurerestore_core::manifest::InstallKind;
use futurerestore_core::orchestrator::{AbortFlag, Orchestrator, RestoreOptions, RestorePlan};
use futurerestore_core::verifier::VerifyOptions;
use futurerestore_core::{ComponentCache, Error};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

fn base_options(ipsw_path: PathBuf, ticket_paths: Vec<PathBuf>, cache_dir: PathBuf) -> RestoreOptions {
    RestoreOptions {
        ipsw_path,
        ticket_paths,
        install_kind: InstallKind::Erase,
        model: "iPhone14,5".to_string(),
        use_patched_dfu: false,
        no_ibss: false,
        skip_baseband: true,
        skip_sep: true,
        cache_dir,
        disable_cache: false,
        verify_options: VerifyOptions::default(),
        skip_blob: false,
        serial: false,
        no_restore: false,
        boot_args: None,
        set_nonce: None,
        firmware_selector: Selector::LatestSigned,
        latest_sep: false,
        latest_baseband: false,
        sep_override: None,
        sep_manifest_override: None,
        baseband_override: None,
        baseband_manifest_override: None,
    }
}

const ECID: u64 = 0x00A1B2C3D4E5F601;
const BOARD_ID: u64 = 0x08;
const CHIP_ID: u64 = 0x8015;
const NONCE: &[u8] = &[1, 2, 3, 4];

fn write_plist(dict: plist::Dictionary, path: &Path) {
    let value = plist::Value::Dictionary(dict);
    let file = std::fs::File::create(path).unwrap();
    value.to_writer_xml(file).unwrap();
}

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag, content.len() as u8];
    out.extend_from_slice(content);
    out
}

fn der_seq(tag: u8, children: &[Vec<u8>]) -> Vec<u8> {
    let mut content = Vec::new();
    for c in children {
        content.extend_from_slice(c);
    }
    der_tlv(tag, &content)
}

fn fake_im4m(ecid: u64, nonce: &[u8]) -> Vec<u8> {
    let ecid_prop = der_seq(0x30, &[der_tlv(0x16, b"ECID"), der_tlv(0x04, &ecid.to_be_bytes())]);
    let bnch_prop = der_seq(0x30, &[der_tlv(0x16, b"BNCH"), der_tlv(0x04, nonce)]);
    let props_set = der_seq(0x31, &[ecid_prop, bnch_prop]);
    der_seq(0x30, &[der_tlv(0x16, b"IM4M"), der_tlv(0x02, &[0]), props_set])
}

fn write_ticket(path: &Path) {
    let mut dict = plist::Dictionary::new();
    dict.insert("ApImg4Ticket".to_string(), plist::Value::Data(fake_im4m(ECID, NONCE)));
    dict.insert("generator".to_string(), plist::Value::String("0x0000000000000001".to_string()));
    write_plist(dict, path);
}

fn manifest_bytes() -> Vec<u8> {
    let mut info = plist::Dictionary::new();
    info.insert("Variant".to_string(), plist::Value::String("Customer Erase Install (IPSW)".to_string()));

    let mut identity = plist::Dictionary::new();
    identity.insert("ApBoardID".to_string(), plist::Value::String(format!("{:#x}", BOARD_ID)));
    identity.insert("ApChipID".to_string(), plist::Value::String(format!("{:#x}", CHIP_ID)));
    identity.insert("Info".to_string(), plist::Value::Dictionary(info));
    identity.insert("Manifest".to_string(), plist::Value::Dictionary(plist::Dictionary::new()));

    let mut root = plist::Dictionary::new();
    root.insert("BuildIdentities".to_string(), plist::Value::Array(vec![plist::Value::Dictionary(identity)]));

    let mut out = Vec::new();
    plist::Value::Dictionary(root).to_writer_xml(&mut out).unwrap();
    out
}

struct FakeUsb {
    mode: Mutex<Mode>,
    sink: Mutex<Option<Box<dyn Fn(UsbEvent) + Send>>>,
}

impl FakeUsb {
    fn new(mode: Mode) -> Self {
        FakeUsb { mode: Mutex::new(mode), sink: Mutex::new(None) }
    }

    fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink(UsbEvent::ModeChanged(mode));
        }
    }
}

impl UsbTransport for FakeUsb {
    fn current_mode(&self) -> Mode {
        *self.mode.lock().unwrap()
    }
    fn subscribe(&self, sink: Box<dyn Fn(UsbEvent) + Send>) {
        *self.sink.lock().unwrap() = Some(sink);
    }
    fn request_enter_recovery(&self) -> Result<(), Error> {
        self.set_mode(Mode::Recovery);
        Ok(())
    }
    fn request_enter_restore(&self) -> Result<(), Error> {
        self.set_mode(Mode::Restore);
        Ok(())
    }
    fn send_command(&self, _text: &str) -> Result<(), Error> {
        Ok(())
    }
    fn set_env(&self, _key: &str, _value: &str) -> Result<(), Error> {
        Ok(())
    }
    fn save_env(&self) -> Result<(), Error> {
        Ok(())
    }
    fn set_autoboot(&self, _enabled: bool) -> Result<(), Error> {
        Ok(())
    }
    fn send_buffer(&self, _name: &str, _bytes: &[u8]) -> Result<(), Error> {
        Ok(())
    }
    fn live_ap_nonce(&self) -> Result<Vec<u8>, Error> {
        Ok(NONCE.to_vec())
    }
    fn live_sep_nonce(&self) -> Result<Vec<u8>, Error> {
        Ok(vec![])
    }
    fn reset(&self) -> Result<(), Error> {
        Ok(())
    }
    fn chip_id(&self) -> u64 {
        CHIP_ID
    }
    fn board_id(&self) -> u64 {
        BOARD_ID
    }
    fn ecid(&self) -> u64 {
        ECID
    }
    fn supports_image4(&self) -> bool {
        true
    }
}

struct FakeDownload;

impl DownloadTransport for FakeDownload {
    fn get_json(&self, _url: &str) -> Result<serde_json::Value, Error> {
        Ok(serde_json::json!({}))
    }
    fn download_archive_member(&self, _url: &str, _member_path: &str) -> Result<Vec<u8>, Error> {
        Ok(Vec::new())
    }
}

struct FakeArchive;

impl ArchiveReader for FakeArchive {
    fn read_member(&self, _archive_path: &Path, member: &str) -> Result<Vec<u8>, Error> {
        if member == "BuildManifest.plist" {
            Ok(manifest_bytes())
        } else {
            Ok(Vec::new())
        }
    }
}

struct RecordingRestoreEngine {
    executed: Mutex<Option<String>>,
}

impl RestoreEngine for RecordingRestoreEngine {
    fn execute(&self, plan: &RestorePlan) -> Result<(), Error> {
        *self.executed.lock().unwrap() = Some(plan.ticket.source_path.display().to_string());
        Ok(())
    }
}

struct NoPatcher;
impl BootloaderPatcher for NoPatcher {
    fn patch_ibss(&self, _s: &[u8], _i: &[u8], _b: &str) -> Result<Vec<u8>, Error> {
        unimplemented!()
    }
    fn patch_ibec(&self, _s: &[u8], _i: &[u8], _b: &str, _a: Option<&str>) -> Result<Vec<u8>, Error> {
        unimplemented!()
    }
}

#[test]
fn full_restore_succeeds_with_matching_ticket() {
    let tmp = tempfile::tempdir().unwrap();
    let ticket_path = tmp.path().join("device.shsh2");
    write_ticket(&ticket_path);

    let ipsw_path = tmp.path().join("firmware.ipsw");
    std::fs::File::create(&ipsw_path).unwrap().write_all(b"not a real zip, only read_member is faked").unwrap();

    let cache_dir = tmp.path().join("cache");

    let transport: Arc<dyn DownloadTransport> = Arc::new(FakeDownload);
    let archive_reader: Arc<dyn ArchiveReader> = Arc::new(FakeArchive);
    let cache = ComponentCache::new(cache_dir, transport.clone(), archive_reader.clone(), false).unwrap();
    let firmware_index = FirmwareIndex::new(transport.clone(), "http://release", "http://beta", "http://ota", "http://{family}/{build}");
    let device = DeviceSession::new(Box::new(FakeUsb::new(Mode::Normal)));
    let restore_engine = Arc::new(RecordingRestoreEngine { executed: Mutex::new(None) });

    let orchestrator = Orchestrator::new(
        device,
        cache,
        firmware_index,
        archive_reader,
        Some(Arc::new(NoPatcher)),
        restore_engine.clone(),
    );

    let options = base_options(ipsw_path, vec![ticket_path.clone()], tmp.path().join("cache2"));

    let abort = AbortFlag::new();
    orchestrator.run(&options, &abort).unwrap();

    let executed = restore_engine.executed.lock().unwrap();
    assert_eq!(executed.as_deref(), Some(ticket_path.display().to_string().as_str()));
}

#[test]
fn restore_fails_when_no_ticket_matches_device_ecid() {
    let tmp = tempfile::tempdir().unwrap();
    let ticket_path = tmp.path().join("other_device.shsh2");

    let mut dict = plist::Dictionary::new();
    dict.insert("ApImg4Ticket".to_string(), plist::Value::Data(fake_im4m(0xDEADBEEF, NONCE)));
    write_plist(dict, &ticket_path);

    let ipsw_path = tmp.path().join("firmware.ipsw");
    std::fs::File::create(&ipsw_path).unwrap();

    let transport: Arc<dyn DownloadTransport> = Arc::new(FakeDownload);
    let archive_reader: Arc<dyn ArchiveReader> = Arc::new(FakeArchive);
    let cache = ComponentCache::new(tmp.path().join("cache"), transport.clone(), archive_reader.clone(), false).unwrap();
    let firmware_index = FirmwareIndex::new(transport.clone(), "http://release", "http://beta", "http://ota", "http://{family}/{build}");
    let device = DeviceSession::new(Box::new(FakeUsb::new(Mode::Normal)));
    let restore_engine = Arc::new(RecordingRestoreEngine { executed: Mutex::new(None) });

    let orchestrator = Orchestrator::new(device, cache, firmware_index, archive_reader, None, restore_engine);

    let options = base_options(ipsw_path, vec![ticket_path], tmp.path().join("cache2"));

    let abort = AbortFlag::new();
    let result = orchestrator.run(&options, &abort);
    assert!(matches!(result, Err(Error::DeviceNotFound)));
}
