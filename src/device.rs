//! Device Session (spec §4.2): owns exactly one attached device, tracks its
//! current boot mode, and exposes mode transitions and control-endpoint
//! commands.

use crate::external::{UsbEvent, UsbTransport};
use crate::Error;
use std::ops::RangeInclusive;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// The states a device passes through during an out-of-window restore
/// (spec §4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Unknown,
    Normal,
    Recovery,
    Dfu,
    Restore,
}

/// Which patched bootloaders a chip family needs on the DFU path (spec
/// §4.2, §9 "should be made a data table").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootloaderGeneration {
    /// Uploading a patched `iBSS` alone transitions the device to
    /// `Recovery`.
    IbssOnly,
    /// A patched `iBSS` is uploaded first, then a patched `iBEC`; only the
    /// second upload yields `Recovery`.
    IbssThenIbec,
}

/// Chip-id ranges handled by the patched-DFU path, grounded on the source
/// this core replaces (`chip_id in 0x7000..=0x8004 or 0x8900..=0x8965`
/// needs both stages; `0x8006..=0x8030 or 0x8101..=0x8301` needs only
/// `iBSS`). Any chip id outside both ranges means "Device not supported"
/// there; this core surfaces that as `Error::PatchedBootloaderUnavailable`
/// instead of a generic failure.
const CHIP_ID_TABLE: &[(RangeInclusive<u64>, BootloaderGeneration)] = &[
    (0x7000..=0x8004, BootloaderGeneration::IbssThenIbec),
    (0x8900..=0x8965, BootloaderGeneration::IbssThenIbec),
    (0x8006..=0x8030, BootloaderGeneration::IbssOnly),
    (0x8101..=0x8301, BootloaderGeneration::IbssOnly),
];

/// Looks up the bootloader generation for a chip id (spec §9 data table).
pub fn bootloader_generation(chip_id: u64) -> Result<BootloaderGeneration, Error> {
    CHIP_ID_TABLE
        .iter()
        .find(|(range, _)| range.contains(&chip_id))
        .map(|(_, gen)| *gen)
        .ok_or_else(|| Error::PatchedBootloaderUnavailable {
            reason: format!("chip id {:#06x} is not in the supported patched-DFU table", chip_id),
        })
}

/// Synthesized device metadata (spec §2 item 2, §3).
#[derive(Clone, Copy, Debug)]
pub struct DeviceInfo {
    pub chip_id: u64,
    pub board_id: u64,
    pub ecid: u64,
    pub supports_image4: bool,
    /// The device's boot mode at the moment this snapshot was taken, so the
    /// Compatibility Verifier's mode-precondition check (spec §4.5 check 1)
    /// has something to assert against instead of relying on call order.
    pub mode: Mode,
}

const DEFAULT_TRANSITION_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns one attached device's USB handle and its observed boot mode (spec
/// §4.2). Mode-event delivery runs on the transport's own callback thread
/// and is funneled through a mutex-protected condition variable, per the
/// redesign called for in spec §9 ("typed handle with interior mutability
/// protected by a mutex and a condition variable").
pub struct DeviceSession {
    transport: Box<dyn UsbTransport>,
    state: Arc<(Mutex<Mode>, Condvar)>,
}

impl DeviceSession {
    /// Takes ownership of `transport` and installs the event sink that
    /// funnels `UsbEvent`s into the mutex/condvar pair.
    pub fn new(transport: Box<dyn UsbTransport>) -> Self {
        let state = Arc::new((Mutex::new(transport.current_mode()), Condvar::new()));
        let sink_state = state.clone();
        transport.subscribe(Box::new(move |event| {
            let new_mode = match event {
                UsbEvent::Detached => Mode::Unknown,
                UsbEvent::Attached(mode) => mode,
                UsbEvent::ModeChanged(mode) => mode,
            };
            let (lock, cvar) = &*sink_state;
            let mut guard = lock.lock().unwrap();
            *guard = new_mode;
            cvar.notify_all();
        }));

        DeviceSession { transport, state }
    }

    pub fn current_mode(&self) -> Mode {
        *self.state.0.lock().unwrap()
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            chip_id: self.transport.chip_id(),
            board_id: self.transport.board_id(),
            ecid: self.transport.ecid(),
            supports_image4: self.transport.supports_image4(),
            mode: self.current_mode(),
        }
    }

    /// Blocks until a USB event causes the observed mode to equal `mode`,
    /// or the default 10s timeout elapses (spec §4.2).
    pub fn wait_for(&self, mode: Mode) -> Result<(), Error> {
        self.wait_for_timeout(mode, DEFAULT_TRANSITION_TIMEOUT)
    }

    pub fn wait_for_timeout(&self, mode: Mode, timeout: Duration) -> Result<(), Error> {
        let (lock, cvar) = &*self.state;
        let deadline = Instant::now() + timeout;
        let mut guard = lock.lock().unwrap();
        while *guard != mode {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::TransitionTimeout { wanted: format!("{:?}", mode) });
            }
            let (next_guard, timeout_result) = cvar.wait_timeout(guard, remaining).unwrap();
            guard = next_guard;
            if timeout_result.timed_out() && *guard != mode {
                return Err(Error::TransitionTimeout { wanted: format!("{:?}", mode) });
            }
        }
        Ok(())
    }

    fn require_mode(&self, wanted: Mode, op: &str) -> Result<(), Error> {
        let found = self.current_mode();
        if found != wanted {
            return Err(Error::UnexpectedMode { wanted: format!("{:?} (for {})", wanted, op), found: format!("{:?}", found) });
        }
        Ok(())
    }

    /// `Normal -> Recovery`: send the in-band request, then wait for
    /// detach and re-attach in `Recovery` (spec §4.2).
    pub fn transition_normal_to_recovery(&self) -> Result<(), Error> {
        self.require_mode(Mode::Normal, "enter recovery")?;
        self.transport.request_enter_recovery()?;
        self.wait_for(Mode::Recovery)
    }

    /// `DFU -> Recovery` via the patched-bootloader path: upload a patched
    /// `iBSS`, then (only for chip ids that need it) a patched `iBEC`
    /// (spec §4.2).
    pub fn transition_dfu_to_recovery_patched(&self, ibss: &[u8], ibec: Option<&[u8]>) -> Result<(), Error> {
        self.require_mode(Mode::Dfu, "upload patched iBSS")?;
        self.transport.send_buffer("iBSS", ibss)?;

        let chip_id = self.transport.chip_id();
        match bootloader_generation(chip_id)? {
            BootloaderGeneration::IbssOnly => self.wait_for(Mode::Recovery),
            BootloaderGeneration::IbssThenIbec => {
                self.wait_for(Mode::Recovery)?;
                let ibec = ibec.ok_or_else(|| Error::SendFailed { what: "iBEC (none supplied)".into() })?;
                self.transport.send_buffer("iBEC", ibec)?;
                self.wait_for(Mode::Recovery)
            }
        }
    }

    /// `Recovery -> Restore` (spec §4.2).
    pub fn transition_recovery_to_restore(&self) -> Result<(), Error> {
        self.require_mode(Mode::Recovery, "enter restore")?;
        self.transport.request_enter_restore()?;
        self.wait_for(Mode::Restore)
    }

    pub fn send_command(&self, text: &str) -> Result<(), Error> {
        self.require_mode(Mode::Recovery, "send_command")?;
        self.transport.send_command(text)
    }

    pub fn set_env(&self, key: &str, value: &str) -> Result<(), Error> {
        self.require_mode(Mode::Recovery, "set_env")?;
        self.transport.set_env(key, value)
    }

    pub fn save_env(&self) -> Result<(), Error> {
        self.require_mode(Mode::Recovery, "save_env")?;
        self.transport.save_env()
    }

    pub fn set_autoboot(&self, enabled: bool) -> Result<(), Error> {
        self.transport.set_autoboot(enabled)
    }

    pub fn send_buffer(&self, name: &str, bytes: &[u8]) -> Result<(), Error> {
        self.transport.send_buffer(name, bytes)
    }

    pub fn live_ap_nonce(&self) -> Result<Vec<u8>, Error> {
        self.transport.live_ap_nonce()
    }

    pub fn live_sep_nonce(&self) -> Result<Vec<u8>, Error> {
        self.transport.live_sep_nonce()
    }

    pub fn reset(&self) -> Result<(), Error> {
        self.transport.reset()
    }
}
