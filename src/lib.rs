//! Core engine for an out-of-window firmware restore.
//!
//! The daemon this crate's vendor normally talks to only signs a firmware
//! image while that image is the currently-shipping one. This crate drives
//! a device through its USB boot-mode transitions using previously-captured
//! per-device signing tickets so that an older, no-longer-signed firmware
//! can still be restored, together with currently-signed auxiliary firmware
//! (baseband, secure enclave, co-processors) where the restore requires it.
//!
//! See `DESIGN.md` for the grounding of each module and the open-question
//! decisions made along the way.

#[macro_use]
extern crate log;
#[macro_use]
extern crate shrinkwraprs;

pub mod asn1;
pub mod cache;
pub mod cli;
pub mod device;
pub mod external;
pub mod firmware_index;
pub mod manifest;
pub mod orchestrator;
pub mod plist_ext;
pub mod ticket;
pub mod verifier;

pub use crate::{
    cache::ComponentCache,
    device::{DeviceInfo, DeviceSession, Mode},
    firmware_index::FirmwareIndex,
    manifest::{BuildIdentity, Component, Manifest},
    orchestrator::{Orchestrator, RestoreOptions, RestorePlan},
    ticket::{Ticket, TicketStore},
    verifier::{CompatibilityVerifier, VerifyOutcome},
};

use std::io;

/// Stable, enumerable error kinds for the whole core (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load signing ticket at {path}: {reason}")]
    BadTicket { path: String, reason: String },

    #[error("ticket ECID does not match device ECID (ticket: {ticket_ecid:#018x}, device: {device_ecid:#018x})")]
    TicketMismatchEcid { ticket_ecid: u64, device_ecid: u64 },

    #[error("ticket nonce does not match live device nonce")]
    TicketMismatchNonce,

    #[error("no BuildIdentity in the manifest matches the chosen ticket")]
    TicketMismatchIdentity,

    #[error("no device is attached")]
    DeviceNotFound,

    #[error("device is in an unexpected mode: wanted {wanted:?}, found {found:?}")]
    UnexpectedMode { wanted: String, found: String },

    #[error("timed out waiting for device to transition to {wanted:?}")]
    TransitionTimeout { wanted: String },

    #[error("failed to send {what} to the device")]
    SendFailed { what: String },

    #[error("archive does not contain a BuildManifest.plist")]
    ManifestMissing,

    #[error("build manifest is malformed: {0}")]
    ManifestMalformed(String),

    #[error("no firmware version {selector} is available for {model}")]
    NoSuchVersion { model: String, selector: String },

    #[error("every candidate version for {model} is beta-only and unsigned")]
    NoSignedVersion { model: String },

    #[error("failed to download {what}: {reason}")]
    DownloadFailed { what: String, reason: String },

    #[error("digest mismatch for {what}: expected {expected}, got {actual}")]
    DigestMismatch { what: String, expected: String, actual: String },

    #[error("external restore engine failed: {0}")]
    ExternalRestoreFailed(String),

    #[error("patched-DFU path requested but no bootloader-patching collaborator is linked in ({reason})")]
    PatchedBootloaderUnavailable { reason: String },

    #[error("restore was aborted")]
    Aborted,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
