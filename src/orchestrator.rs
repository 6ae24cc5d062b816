//! Restore Orchestrator (spec §4.6): drives a single restore attempt
//! end-to-end, wiring together every other component in this crate and the
//! external collaborators declared in `external.rs`.

use crate::cache::{self, ArchiveLocator, ComponentCache, ComponentSource, COMPONENT_TABLE};
use crate::device::{DeviceSession, Mode};
use crate::external::{ArchiveReader, BootloaderPatcher, DownloadTransport, RestoreEngine};
use crate::firmware_index::{FirmwareIndex, Selector};
use crate::manifest::{BuildIdentity, Component, InstallKind, Manifest};
use crate::ticket::{Ticket, TicketStore};
use crate::verifier::{self, CompatibilityVerifier, VerifyOptions};
use crate::Error;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Caller-settable knobs for one restore attempt (spec §6 CLI surface,
/// §4.6).
pub struct RestoreOptions {
    pub ipsw_path: PathBuf,
    pub ticket_paths: Vec<PathBuf>,
    pub install_kind: InstallKind,
    pub model: String,
    /// Use the patched-DFU path (`DFU -> Recovery` via a patched
    /// bootloader) instead of requiring the device already be in Normal
    /// mode (spec §4.2, §4.6 step 5).
    pub use_patched_dfu: bool,
    /// The caller is managing the first-stage bootloader itself; the
    /// Verifier accepts a live `Dfu` mode device for this reason alone
    /// (spec §4.5 check 1).
    pub no_ibss: bool,
    pub skip_baseband: bool,
    pub skip_sep: bool,
    pub cache_dir: PathBuf,
    pub disable_cache: bool,
    pub verify_options: VerifyOptions,
    /// Downgrade an ECID mismatch between the chosen ticket and the live
    /// device from a hard error to a warning (spec §4.5 check 2).
    pub skip_blob: bool,
    /// Append `serial=0x3` to the patched iBEC's boot-args so the device
    /// emits its serial console output (spec §6).
    pub serial: bool,
    /// Prepare everything up to and including handing a `RestorePlan` off,
    /// but stop short of calling the external `RestoreEngine`.
    pub no_restore: bool,
    /// Extra boot-args passed to the patched `iBEC` (spec §6 `--boot-args`).
    pub boot_args: Option<String>,
    /// A caller-supplied `0x%016x` generator to program into NVRAM instead
    /// of the one derived from the ticket's own SHSH2 blob (spec §6
    /// `--set-nonce`).
    pub set_nonce: Option<String>,
    /// The selector used to resolve SEP/baseband firmware from the
    /// Firmware Index (spec §6 `--custom-latest`/`--custom-latest-build`;
    /// defaults to `Selector::LatestSigned`).
    pub firmware_selector: Selector,
    /// Forces SEP resolution back to `Selector::LatestSigned` even when
    /// `firmware_selector` names a custom version/build (spec §6
    /// `--latest-sep`).
    pub latest_sep: bool,
    /// Same as `latest_sep`, for baseband (spec §6 `--latest-baseband`).
    pub latest_baseband: bool,
    /// Explicit local SEP firmware + manifest, bypassing the Firmware
    /// Index entirely (spec §6 `--sep`/`--sep-manifest`).
    pub sep_override: Option<PathBuf>,
    pub sep_manifest_override: Option<PathBuf>,
    /// Explicit local baseband firmware + manifest, bypassing the
    /// Firmware Index entirely (spec §6 `--baseband`/`--baseband-manifest`).
    pub baseband_override: Option<PathBuf>,
    pub baseband_manifest_override: Option<PathBuf>,
}

/// Cooperative cancellation checked between orchestrator steps (spec §4.6
/// "Concurrency": a caller-owned flag, not a forced thread kill).
#[derive(Clone, Default, Shrinkwrap)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        AbortFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), Error> {
        if self.is_aborted() {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Everything the external `RestoreEngine` collaborator needs to stream a
/// restore to the device (spec §4.6 step 8, §1 Non-goals: "the engine that
/// streams bytes to the device mode endpoint" is out of scope here).
pub struct RestorePlan {
    pub identity: BuildIdentity,
    pub ticket: Ticket,
    pub components: Vec<Component>,
    pub install_kind: InstallKind,
}

pub struct Orchestrator {
    device: DeviceSession,
    cache: ComponentCache,
    firmware_index: FirmwareIndex,
    archive_reader: Arc<dyn ArchiveReader>,
    bootloader_patcher: Option<Arc<dyn BootloaderPatcher>>,
    restore_engine: Arc<dyn RestoreEngine>,
}

impl Orchestrator {
    pub fn new(
        device: DeviceSession,
        cache: ComponentCache,
        firmware_index: FirmwareIndex,
        archive_reader: Arc<dyn ArchiveReader>,
        bootloader_patcher: Option<Arc<dyn BootloaderPatcher>>,
        restore_engine: Arc<dyn RestoreEngine>,
    ) -> Self {
        Orchestrator { device, cache, firmware_index, archive_reader, bootloader_patcher, restore_engine }
    }

    /// Runs the full restore algorithm (spec §4.6):
    ///
    /// 1. load signing tickets
    /// 2. read the live device's identity
    /// 3. find the ticket matching that device's ECID
    /// 4. parse the user-supplied IPSW's `BuildManifest.plist` and select a
    ///    `BuildIdentity` for `(board, install_kind)`
    /// 5. bring the device into Recovery mode, either directly or via the
    ///    patched-DFU path
    /// 6. read the live AP nonce and run the Compatibility Verifier
    /// 7. populate the Component Cache, fetching SEP and baseband from the
    ///    Firmware Index rather than the user-supplied archive
    /// 8. assemble a `RestorePlan`
    /// 9. transition the device into Restore mode
    /// 10. hand the plan to the external `RestoreEngine`
    /// 11. report the outcome
    pub fn run(&self, options: &RestoreOptions, abort: &AbortFlag) -> Result<(), Error> {
        abort.check()?;
        let mut tickets = TicketStore::new();
        tickets.load(&options.ticket_paths, options.install_kind)?;

        abort.check()?;
        let device_info = self.device.device_info();

        // Every ticket sharing the device's ECID is a candidate. The first
        // one loaded stitches the patched bootloader's IM4M below, matching
        // the survey ticket the original used for that same step; once the
        // device is confirmed in Recovery and its live nonce is known, the
        // final ticket is re-picked by nonce/generator match (spec I1,
        // §4.6 step 3).
        let candidates: Vec<Ticket> = tickets.iter().filter(|t| t.ecid == device_info.ecid).cloned().collect();
        let provisional_ticket = candidates.first().ok_or(Error::DeviceNotFound)?.clone();

        abort.check()?;
        let manifest_bytes = self.archive_reader.read_member(&options.ipsw_path, "BuildManifest.plist")?;
        let manifest = Manifest::parse(&manifest_bytes)?;
        let (identity, fallback_fired) = manifest.select_identity(device_info.board_id, options.install_kind)?;
        let identity = identity.clone();

        abort.check()?;
        self.bring_device_to_recovery(options, &device_info, &provisional_ticket)?;

        if let Some(generator_hex) = &options.set_nonce {
            self.device.set_env("com.apple.System.boot-nonce", generator_hex)?;
            self.device.save_env()?;
            self.device.reset()?;
            self.device.wait_for(Mode::Recovery)?;
        }

        abort.check()?;
        let live_ap_nonce = self.device.live_ap_nonce()?;
        let ticket = candidates
            .iter()
            .find(|t| verifier::nonce_matches(t, &live_ap_nonce))
            .cloned()
            .unwrap_or(provisional_ticket);
        let device_info = crate::device::DeviceInfo { mode: self.device.current_mode(), ..device_info };

        let verifier = CompatibilityVerifier::new(options.verify_options);
        let fallback = if fallback_fired {
            Some((options.install_kind, options.install_kind.opposite()))
        } else {
            None
        };
        // IM4M signature cryptography is delegated to the restore engine's
        // own trust chain; this core assumes it has already been checked by
        // the time a ticket reaches here unless a front end wires in a
        // dedicated verifier ahead of this call.
        let outcome = verifier.verify(
            &ticket,
            &device_info,
            options.use_patched_dfu,
            options.no_ibss,
            &live_ap_nonce,
            &identity,
            fallback,
            true,
            options.skip_blob,
        )?;
        for warning in &outcome.warnings {
            warn!("compatibility warning: {:?}", warning);
        }

        if ticket.kind == crate::ticket::TicketKind::Legacy {
            self.device.send_buffer("ApTicket", &ticket.raw_im4m)?;
        }

        abort.check()?;
        let components = self.populate_components(options, &identity, &device_info, &verifier)?;

        abort.check()?;
        let plan = RestorePlan { identity, ticket, components, install_kind: options.install_kind };

        if options.no_restore {
            info!("no-restore set, stopping short of invoking the restore engine for ecid {:#018x}", device_info.ecid);
            return Ok(());
        }

        abort.check()?;
        self.device.transition_recovery_to_restore()?;

        abort.check()?;
        self.restore_engine.execute(&plan).map_err(|e| Error::ExternalRestoreFailed(e.to_string()))?;

        self.device.set_autoboot(true)?;

        info!("restore completed for ecid {:#018x}", device_info.ecid);
        Ok(())
    }

    fn bring_device_to_recovery(
        &self,
        options: &RestoreOptions,
        device_info: &crate::device::DeviceInfo,
        ticket: &Ticket,
    ) -> Result<(), Error> {
        match self.device.current_mode() {
            Mode::Recovery => Ok(()),
            Mode::Normal => self.device.transition_normal_to_recovery(),
            Mode::Dfu if options.use_patched_dfu => {
                let patcher = self
                    .bootloader_patcher
                    .as_ref()
                    .ok_or_else(|| Error::PatchedBootloaderUnavailable { reason: "no bootloader patcher linked in".to_string() })?;

                let stock_ibss = self.archive_reader.read_member(&options.ipsw_path, "Firmware/dfu/iBSS.img4")?;
                let stock_ibec = self.archive_reader.read_member(&options.ipsw_path, "Firmware/dfu/iBEC.img4")?;
                let board = format!("{:#x}", device_info.board_id);

                let mut boot_args = options.boot_args.clone().unwrap_or_default();
                if options.serial {
                    boot_args.push_str("serial=0x3 ");
                }
                let boot_args = if boot_args.is_empty() { None } else { Some(boot_args.as_str()) };

                let patched_ibss = patcher.patch_ibss(&stock_ibss, &ticket.raw_im4m, &board)?;
                let needs_ibec =
                    matches!(crate::device::bootloader_generation(device_info.chip_id)?, crate::device::BootloaderGeneration::IbssThenIbec);
                let patched_ibec =
                    if needs_ibec { Some(patcher.patch_ibec(&stock_ibec, &ticket.raw_im4m, &board, boot_args)?) } else { None };

                self.device.transition_dfu_to_recovery_patched(&patched_ibss, patched_ibec.as_deref())
            }
            // The caller manages the first-stage bootloader itself; leave
            // the device in `Dfu` as found and let the Verifier's mode
            // precondition (which allows this combination) decide whether
            // to proceed (spec §4.5 check 1, spec.md:135).
            Mode::Dfu if options.no_ibss => Ok(()),
            other => Err(Error::UnexpectedMode { wanted: "Normal or Dfu".to_string(), found: format!("{:?}", other) }),
        }
    }

    fn populate_components(
        &self,
        options: &RestoreOptions,
        identity: &BuildIdentity,
        device_info: &crate::device::DeviceInfo,
        verifier: &CompatibilityVerifier,
    ) -> Result<Vec<Component>, Error> {
        let algorithm = cache::hash_algorithm_for_chip(device_info.chip_id);
        let mut components = Vec::new();

        let source = ComponentSource { archive: ArchiveLocator::Local(&options.ipsw_path), is_ota: false };
        for spec in COMPONENT_TABLE {
            if spec.name == "SE,UpdatePayload" {
                if let Some(component) = self.cache.materialize_se(identity, &source)? {
                    components.push(component);
                }
                continue;
            }
            if let Some(component) = self.cache.materialize(*spec, identity, &source, algorithm)? {
                components.push(component);
            }
        }

        if !options.skip_sep {
            let sep_component = if let (Some(sep_path), Some(sep_manifest_path)) =
                (&options.sep_override, &options.sep_manifest_override)
            {
                let sep_manifest_bytes = fs::read(sep_manifest_path)?;
                let sep_manifest = Manifest::parse(&sep_manifest_bytes)?;
                let (sep_identity, _) = sep_manifest.select_identity(device_info.board_id, options.install_kind)?;
                let bytes = fs::read(sep_path)?;
                verifier.verify_sep_coherence(sep_identity, &bytes)?;
                let digest = sep_identity.component(cache::SEP_COMPONENT).and_then(|e| e.digest.clone()).unwrap_or_default();
                Some(Component { name: cache::SEP_COMPONENT.to_string(), bytes, digest })
            } else {
                let sep_selector = if options.latest_sep { Selector::LatestSigned } else { options.firmware_selector.clone() };
                let (sep_url, sep_build) = self.firmware_index.resolve(&options.model, &sep_selector)?;
                let sep_manifest_bytes = self.firmware_index.fetch_build_manifest(&sep_url, &options.model, &sep_build)?;
                let sep_manifest = Manifest::parse(&sep_manifest_bytes)?;
                let (sep_identity, _) = sep_manifest.select_identity(device_info.board_id, options.install_kind)?;
                let sep_source = ComponentSource { archive: ArchiveLocator::Remote(&sep_url), is_ota: false };
                let component = self.cache.materialize_sep(sep_identity, &sep_source, algorithm)?;
                if let Some(component) = &component {
                    verifier.verify_sep_coherence(sep_identity, &component.bytes)?;
                }
                component
            };
            if let Some(component) = sep_component {
                components.push(component);
            }
        }

        if !options.skip_baseband {
            let bb_component = if let (Some(bb_path), Some(bb_manifest_path)) =
                (&options.baseband_override, &options.baseband_manifest_override)
            {
                let bb_manifest_bytes = fs::read(bb_manifest_path)?;
                let bb_manifest = Manifest::parse(&bb_manifest_bytes)?;
                let (bb_identity, _) = bb_manifest.select_identity(device_info.board_id, options.install_kind)?;
                let bytes = fs::read(bb_path)?;
                let digest = bb_identity.component(cache::BASEBAND_COMPONENT).and_then(|e| e.bbcfg_download_digest.clone()).unwrap_or_default();
                Some(Component { name: cache::BASEBAND_COMPONENT.to_string(), bytes, digest })
            } else {
                let bb_selector = if options.latest_baseband { Selector::LatestSigned } else { options.firmware_selector.clone() };
                let (bb_url, bb_build) = self.firmware_index.resolve(&options.model, &bb_selector)?;
                let bb_manifest_bytes = self.firmware_index.fetch_build_manifest(&bb_url, &options.model, &bb_build)?;
                let bb_manifest = Manifest::parse(&bb_manifest_bytes)?;
                let (bb_identity, _) = bb_manifest.select_identity(device_info.board_id, options.install_kind)?;
                let bb_source = ComponentSource { archive: ArchiveLocator::Remote(&bb_url), is_ota: false };
                self.cache.materialize_baseband(bb_identity, &bb_source)?
            };
            if let Some(component) = bb_component {
                components.push(component);
            }
        }

        Ok(components)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_flag_starts_clear() {
        let flag = AbortFlag::new();
        assert!(!flag.is_aborted());
        flag.abort();
        assert!(flag.is_aborted());
        assert!(flag.check().is_err());
    }
}
