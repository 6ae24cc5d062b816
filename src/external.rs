//! Trait seams for every collaborator spec.md §1/§6 declares out of scope:
//! the USB transport, the HTTP(S)/partial-ZIP download transport, the
//! local-archive reader, the patched-bootloader builder, and the vendor's
//! own restore state machine. The core depends only on these traits; a
//! front end links in concrete implementations.

use crate::device::Mode;
use crate::orchestrator::RestorePlan;
use crate::Error;
use std::path::Path;

/// An event the USB transport's callback thread observes (spec §4.2,
/// §5). Delivered to whatever sink `UsbTransport::subscribe` was given;
/// `DeviceSession` is the only consumer in this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbEvent {
    Attached(Mode),
    Detached,
    ModeChanged(Mode),
}

/// Owns exactly one device's USB handle. Implementations run their own
/// event-callback thread and must deliver events to every sink registered
/// with `subscribe` (spec §4.2 "Concurrency").
pub trait UsbTransport: Send {
    fn current_mode(&self) -> Mode;
    fn subscribe(&self, sink: Box<dyn Fn(UsbEvent) + Send>);

    /// Sends the in-band "enter recovery" request valid in `Normal` mode
    /// (spec §4.2, `Normal -> Recovery`).
    fn request_enter_recovery(&self) -> Result<(), Error>;
    /// Issues the vendor-defined "enter restore" command, valid in
    /// `Recovery` mode (spec §4.2, `Recovery -> Restore`).
    fn request_enter_restore(&self) -> Result<(), Error>;

    fn send_command(&self, text: &str) -> Result<(), Error>;
    fn set_env(&self, key: &str, value: &str) -> Result<(), Error>;
    fn save_env(&self) -> Result<(), Error>;
    fn set_autoboot(&self, enabled: bool) -> Result<(), Error>;
    fn send_buffer(&self, name: &str, bytes: &[u8]) -> Result<(), Error>;
    fn live_ap_nonce(&self) -> Result<Vec<u8>, Error>;
    fn live_sep_nonce(&self) -> Result<Vec<u8>, Error>;
    fn reset(&self) -> Result<(), Error>;

    fn chip_id(&self) -> u64;
    fn board_id(&self) -> u64;
    fn ecid(&self) -> u64;
    fn supports_image4(&self) -> bool;
}

/// HTTP(S) access for firmware catalogs and partial-ZIP reads (spec §4.3,
/// §4.4, §6).
pub trait DownloadTransport: Send + Sync {
    fn get_json(&self, url: &str) -> Result<serde_json::Value, Error>;

    /// Reads a single named member out of a remote ZIP archive without
    /// downloading the whole archive, using an HTTP `Range` request (spec
    /// §6 "the transport must issue an HTTP Range request").
    fn download_archive_member(&self, url: &str, member_path: &str) -> Result<Vec<u8>, Error>;
}

/// Reads members out of a local archive file (the user-supplied IPSW) --
/// spec §6 "ZIP ... parsers" collaborator.
pub trait ArchiveReader: Send + Sync {
    fn read_member(&self, archive_path: &Path, member: &str) -> Result<Vec<u8>, Error>;
}

/// Builds patched first/second-stage bootloaders for the patched-DFU path
/// (spec §4.6 step 6, §9 "patched DFU path"). A core built without one
/// linked in must still compile -- attempting the patched-DFU path simply
/// fails with `Error::PatchedBootloaderUnavailable` (spec §7).
pub trait BootloaderPatcher: Send + Sync {
    fn patch_ibss(&self, stock: &[u8], im4m: &[u8], board: &str) -> Result<Vec<u8>, Error>;
    fn patch_ibec(&self, stock: &[u8], im4m: &[u8], board: &str, boot_args: Option<&str>) -> Result<Vec<u8>, Error>;
}

/// The vendor's own low-level restore state machine, out of scope per
/// spec.md §1: "the engine that streams bytes to the device mode
/// endpoint".
pub trait RestoreEngine: Send + Sync {
    fn execute(&self, plan: &RestorePlan) -> Result<(), Error>;
}
