//! CLI front end wiring the core engine to concrete collaborators.
//!
//! The USB transport, patched-bootloader builder, and vendor restore
//! engine are device- and vendor-specific out of scope per this crate's
//! non-goals; this binary fails fast with `PatchedBootloaderUnavailable`/
//! `ExternalRestoreFailed` if a caller reaches those paths without a real
//! implementation linked in. The download transport and archive reader are
//! implemented here with `reqwest` and `zip`, matching the crate's ambient
//! stack.

#[macro_use]
extern crate log;

use clap::Parser;
use futurerestore_core::cli::Cli;
use futurerestore_core::device::{DeviceSession, Mode};
use futurerestore_core::external::{ArchiveReader, BootloaderPatcher, DownloadTransport, RestoreEngine, UsbEvent, UsbTransport};
use futurerestore_core::firmware_index::FirmwareIndex;
use futurerestore_core::orchestrator::{AbortFlag, Orchestrator, RestorePlan};
use futurerestore_core::{ComponentCache, Error};
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

const RELEASE_CATALOG_URL: &str = "https://api.ipsw.me/v4/ipsw/firmwares.json";
const BETA_CATALOG_URL: &str = "https://api.ipsw.me/v4/ipsw/beta/firmwares.json";
const OTA_CATALOG_URL: &str = "https://api.ipsw.me/v4/ota/firmwares.json";
const SECONDARY_BETA_URL_TEMPLATE: &str = "https://api.ipsw.me/v4/ipsw/{family}/{build}.json";

struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl DownloadTransport for ReqwestTransport {
    fn get_json(&self, url: &str) -> Result<serde_json::Value, Error> {
        self.client
            .get(url)
            .send()
            .and_then(|r| r.json())
            .map_err(|e| Error::DownloadFailed { what: url.to_string(), reason: e.to_string() })
    }

    fn download_archive_member(&self, url: &str, member_path: &str) -> Result<Vec<u8>, Error> {
        let bytes = self
            .client
            .get(url)
            .send()
            .and_then(|r| r.bytes())
            .map_err(|e| Error::DownloadFailed { what: url.to_string(), reason: e.to_string() })?;
        let mut zip = zip::ZipArchive::new(Cursor::new(bytes.as_ref()))
            .map_err(|e| Error::DownloadFailed { what: url.to_string(), reason: e.to_string() })?;
        let mut file = zip
            .by_name(member_path)
            .map_err(|e| Error::DownloadFailed { what: member_path.to_string(), reason: e.to_string() })?;
        let mut out = Vec::new();
        file.read_to_end(&mut out)?;
        Ok(out)
    }
}

struct ZipArchiveReader;

impl ArchiveReader for ZipArchiveReader {
    fn read_member(&self, archive_path: &Path, member: &str) -> Result<Vec<u8>, Error> {
        let file = fs::File::open(archive_path)?;
        let mut zip = zip::ZipArchive::new(file)
            .map_err(|e| Error::BadTicket { path: archive_path.display().to_string(), reason: e.to_string() })?;
        let mut entry = zip
            .by_name(member)
            .map_err(|e| Error::BadTicket { path: archive_path.display().to_string(), reason: e.to_string() })?;
        let mut out = Vec::new();
        entry.read_to_end(&mut out)?;
        Ok(out)
    }
}

struct UnavailableUsbTransport;

impl UsbTransport for UnavailableUsbTransport {
    fn current_mode(&self) -> Mode {
        Mode::Unknown
    }
    fn subscribe(&self, _sink: Box<dyn Fn(UsbEvent) + Send>) {}
    fn request_enter_recovery(&self) -> Result<(), Error> {
        Err(Error::DeviceNotFound)
    }
    fn request_enter_restore(&self) -> Result<(), Error> {
        Err(Error::DeviceNotFound)
    }
    fn send_command(&self, _text: &str) -> Result<(), Error> {
        Err(Error::DeviceNotFound)
    }
    fn set_env(&self, _key: &str, _value: &str) -> Result<(), Error> {
        Err(Error::DeviceNotFound)
    }
    fn save_env(&self) -> Result<(), Error> {
        Err(Error::DeviceNotFound)
    }
    fn set_autoboot(&self, _enabled: bool) -> Result<(), Error> {
        Err(Error::DeviceNotFound)
    }
    fn send_buffer(&self, _name: &str, _bytes: &[u8]) -> Result<(), Error> {
        Err(Error::DeviceNotFound)
    }
    fn live_ap_nonce(&self) -> Result<Vec<u8>, Error> {
        Err(Error::DeviceNotFound)
    }
    fn live_sep_nonce(&self) -> Result<Vec<u8>, Error> {
        Err(Error::DeviceNotFound)
    }
    fn reset(&self) -> Result<(), Error> {
        Err(Error::DeviceNotFound)
    }
    fn chip_id(&self) -> u64 {
        0
    }
    fn board_id(&self) -> u64 {
        0
    }
    fn ecid(&self) -> u64 {
        0
    }
    fn supports_image4(&self) -> bool {
        false
    }
}

struct UnavailableBootloaderPatcher;

impl BootloaderPatcher for UnavailableBootloaderPatcher {
    fn patch_ibss(&self, _stock: &[u8], _im4m: &[u8], _board: &str) -> Result<Vec<u8>, Error> {
        Err(Error::PatchedBootloaderUnavailable { reason: "no bootloader patcher is linked into this binary".into() })
    }
    fn patch_ibec(&self, _stock: &[u8], _im4m: &[u8], _board: &str, _boot_args: Option<&str>) -> Result<Vec<u8>, Error> {
        Err(Error::PatchedBootloaderUnavailable { reason: "no bootloader patcher is linked into this binary".into() })
    }
}

struct UnavailableRestoreEngine;

impl RestoreEngine for UnavailableRestoreEngine {
    fn execute(&self, _plan: &RestorePlan) -> Result<(), Error> {
        Err(Error::ExternalRestoreFailed("no restore engine is linked into this binary".into()))
    }
}

fn default_cache_dir() -> std::path::PathBuf {
    xdg::BaseDirectories::with_prefix("futurerestore-core")
        .ok()
        .and_then(|dirs| dirs.create_cache_directory("components").ok())
        .unwrap_or_else(std::env::temp_dir)
}

fn run() -> Result<(), Error> {
    let cli = Cli::parse();
    let options = cli.into_restore_options(default_cache_dir());

    let transport: Arc<dyn DownloadTransport> = Arc::new(ReqwestTransport { client: reqwest::blocking::Client::new() });
    let archive_reader: Arc<dyn ArchiveReader> = Arc::new(ZipArchiveReader);
    let cache = ComponentCache::new(options.cache_dir.clone(), transport.clone(), archive_reader.clone(), options.disable_cache)?;
    let firmware_index = FirmwareIndex::new(
        transport.clone(),
        RELEASE_CATALOG_URL,
        BETA_CATALOG_URL,
        OTA_CATALOG_URL,
        SECONDARY_BETA_URL_TEMPLATE,
    );
    let device = DeviceSession::new(Box::new(UnavailableUsbTransport));
    let orchestrator = Orchestrator::new(
        device,
        cache,
        firmware_index,
        archive_reader,
        Some(Arc::new(UnavailableBootloaderPatcher)),
        Arc::new(UnavailableRestoreEngine),
    );

    let abort = AbortFlag::new();
    orchestrator.run(&options, &abort)
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
