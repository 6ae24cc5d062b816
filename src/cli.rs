//! Command-line surface (spec §6).

use crate::firmware_index::Selector;
use crate::manifest::InstallKind;
use crate::orchestrator::RestoreOptions;
use crate::verifier::VerifyOptions;
use clap::Parser;
use std::path::PathBuf;

/// Restore an out-of-window firmware using previously-saved signing
/// tickets.
#[derive(Parser, Debug)]
#[command(name = "futurerestore-core", version, about)]
pub struct Cli {
    /// Path to the IPSW to restore.
    pub ipsw_path: PathBuf,

    /// One or more `.shsh`/`.shsh2` ticket files; the one matching the
    /// attached device's ECID and live nonce is used.
    #[arg(long = "apticket", required = true)]
    pub apticket: Vec<PathBuf>,

    /// Device model identifier (e.g. `iPhone14,5`), used to query the
    /// Firmware Index for SEP and baseband.
    #[arg(long)]
    pub model: String,

    /// Perform an update install instead of an erase install.
    #[arg(long)]
    pub update: bool,

    /// Drive the device through the patched-DFU path instead of requiring
    /// it to already be in Normal mode.
    #[arg(long = "use-pwn-dfu")]
    pub use_pwn_dfu: bool,

    /// The caller manages the first-stage bootloader (`iBSS`) itself; the
    /// Compatibility Verifier accepts a live `Dfu`-mode device for this
    /// reason alone.
    #[arg(long = "no-ibss")]
    pub no_ibss: bool,

    /// Program a caller-supplied `0x%016x` generator into NVRAM instead of
    /// the one the ticket's own SHSH2 blob derives.
    #[arg(long = "set-nonce")]
    pub set_nonce: Option<String>,

    /// Append `serial=0x3` to the patched iBEC's boot-args.
    #[arg(long)]
    pub serial: bool,

    /// Prepare everything short of invoking the external restore engine.
    #[arg(long = "no-restore")]
    pub no_restore: bool,

    /// Skip SEP restore entirely.
    #[arg(long = "no-rsep")]
    pub no_rsep: bool,

    /// Directory for the Component Cache. Defaults to the platform cache
    /// directory.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Disable the Component Cache; always re-download every component.
    #[arg(long)]
    pub no_cache: bool,

    /// Downgrade a ticket/device ECID mismatch from a hard error to a
    /// warning.
    #[arg(long = "skip-blob")]
    pub skip_blob: bool,

    /// Extra boot-args passed to the patched `iBEC`.
    #[arg(long = "boot-args")]
    pub boot_args: Option<String>,

    /// Force SEP resolution to the latest signed firmware even when
    /// `--custom-latest`/`--custom-latest-build` names a different one.
    #[arg(long = "latest-sep")]
    pub latest_sep: bool,

    /// Same as `--latest-sep`, for baseband.
    #[arg(long = "latest-baseband")]
    pub latest_baseband: bool,

    /// Accepted for CLI-surface parity: this core already resolves SEP and
    /// baseband from the latest-signed firmware by default (spec §4.6 step
    /// 7), so this flag only confirms the default rather than changing it.
    #[arg(long = "latest-firmware")]
    pub latest_firmware: bool,

    /// Resolve SEP/baseband firmware matching this version instead of the
    /// latest signed one.
    #[arg(long = "custom-latest", value_name = "VER")]
    pub custom_latest: Option<String>,

    /// Resolve SEP/baseband firmware matching this build id instead of the
    /// latest signed one.
    #[arg(long = "custom-latest-build", value_name = "BUILD")]
    pub custom_latest_build: Option<String>,

    /// With `--custom-latest-build`, consult the beta catalog.
    #[arg(long)]
    pub beta: bool,

    /// With `--custom-latest-build`, consult the OTA catalog.
    #[arg(long)]
    pub ota: bool,

    /// Explicit local SEP firmware file, bypassing the Firmware Index.
    #[arg(long)]
    pub sep: Option<PathBuf>,

    /// Build manifest for `--sep`.
    #[arg(long = "sep-manifest")]
    pub sep_manifest: Option<PathBuf>,

    /// Explicit local baseband firmware file, bypassing the Firmware Index.
    #[arg(long)]
    pub baseband: Option<PathBuf>,

    /// Build manifest for `--baseband`.
    #[arg(long = "baseband-manifest")]
    pub baseband_manifest: Option<PathBuf>,

    /// Proceed even if a ticket's IM4M signature does not verify.
    #[arg(long)]
    pub no_im4m_signature_check: bool,
}

impl Cli {
    pub fn install_kind(&self) -> InstallKind {
        if self.update { InstallKind::Update } else { InstallKind::Erase }
    }

    fn firmware_selector(&self) -> Selector {
        if let Some(build) = &self.custom_latest_build {
            Selector::ExactBuild { build: build.clone(), beta: self.beta, ota: self.ota }
        } else if let Some(version) = &self.custom_latest {
            Selector::ExactVersion(version.clone())
        } else {
            Selector::LatestSigned
        }
    }

    pub fn into_restore_options(self, default_cache_dir: PathBuf) -> RestoreOptions {
        let firmware_selector = self.firmware_selector();
        RestoreOptions {
            ipsw_path: self.ipsw_path,
            ticket_paths: self.apticket,
            install_kind: self.install_kind(),
            model: self.model,
            use_patched_dfu: self.use_pwn_dfu,
            no_ibss: self.no_ibss,
            skip_baseband: false,
            skip_sep: self.no_rsep,
            cache_dir: self.cache_dir.unwrap_or(default_cache_dir),
            disable_cache: self.no_cache,
            verify_options: VerifyOptions { require_valid_im4m_signature: !self.no_im4m_signature_check },
            skip_blob: self.skip_blob,
            serial: self.serial,
            no_restore: self.no_restore,
            boot_args: self.boot_args,
            set_nonce: self.set_nonce,
            firmware_selector,
            latest_sep: self.latest_sep,
            latest_baseband: self.latest_baseband,
            sep_override: self.sep,
            sep_manifest_override: self.sep_manifest,
            baseband_override: self.baseband,
            baseband_manifest_override: self.baseband_manifest,
        }
    }
}
