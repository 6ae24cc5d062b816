//! Compatibility Verifier (spec §4.5): checks a chosen ticket against a live
//! device and a selected `BuildIdentity` before committing to a restore.

use crate::asn1;
use crate::cache::{self, HashAlgorithm};
use crate::device::{DeviceInfo, Mode};
use crate::manifest::{BuildIdentity, InstallKind};
use crate::ticket::{Ticket, TicketKind};
use crate::Error;

/// Non-fatal findings the verifier surfaces alongside a successful check
/// (spec §8, §9 open questions). Each variant names the exact condition
/// that triggered it so a front end can decide how loudly to report it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyWarning {
    /// `Manifest::select_identity` could not find a `BuildIdentity` for the
    /// requested install kind and fell back to the opposite one (spec §8
    /// B3). Spec §9 flags that a silent fallback here could mask a
    /// misconfigured `--update`/`--erase` flag, so this core always
    /// reports it as a distinct warning rather than folding it into a
    /// generic "identity selected" log line.
    InstallKindFallback { requested: InstallKind, used: InstallKind },
    /// The ticket's IM4M signature did not verify against the vendor
    /// public key. Only produced when `require_valid_im4m_signature` is
    /// `false`; otherwise this condition is a hard error (spec §9 open
    /// question: "does futurerestore ever proceed with an unverified
    /// signature").
    Im4mSignatureInvalid,
    /// Ticket ECID did not match the live device ECID, downgraded from a
    /// hard error to a warning because `--skip-blob` was passed (spec
    /// §4.5 check 2).
    EcidMismatchIgnored { ticket_ecid: u64, device_ecid: u64 },
}

/// Compares a ticket's nonce against the device's live AP nonce, falling
/// back to the generator-hash check (spec I1, B1) when they differ: a
/// ticket's `generator` is hashed (SHA-1 for a 20-byte live nonce, SHA-384
/// for 48 bytes) and the result compared byte-for-byte against the live
/// nonce. Any other live-nonce length has no defined algorithm and is
/// simply not matched (spec B1).
pub(crate) fn nonce_matches(ticket: &Ticket, live_ap_nonce: &[u8]) -> bool {
    ticket.nonce == live_ap_nonce || generator_hashes_to_nonce(ticket, live_ap_nonce)
}

fn generator_hashes_to_nonce(ticket: &Ticket, live_ap_nonce: &[u8]) -> bool {
    let generator = match ticket.generator {
        Some(g) => g,
        None => return false,
    };
    let algorithm = match live_ap_nonce.len() {
        20 => HashAlgorithm::Sha1,
        48 => HashAlgorithm::Sha384,
        _ => return false,
    };
    cache::digest(&generator.to_le_bytes(), algorithm) == live_ap_nonce
}

/// Spec §4.5 check 4: the aggregate of the identity's signed-component
/// digests must match whatever the ticket's IM4M actually authorizes.
/// Components the ticket's IM4M carries no digest for are not
/// constrained by it and are skipped rather than treated as a mismatch.
fn identity_digests_match(ticket: &Ticket, identity: &BuildIdentity, ignore: &[&str]) -> bool {
    for (name, entry) in &identity.components {
        if ignore.contains(&name.as_str()) {
            continue;
        }
        let expected = match entry.digest.as_deref() {
            Some(d) => d,
            None => continue,
        };
        if let Ok(authorized) = asn1::read_im4m_tag(&ticket.raw_im4m, name) {
            if authorized != expected {
                return false;
            }
        }
    }
    true
}

/// Components a build-identity digest match ignores on retry (spec §4.5
/// check 4): these two are frequently re-signed independently of the rest
/// of the identity on image4 devices.
const IDENTITY_DIGEST_RETRY_IGNORE: &[&str] = &["RestoreRamDisk", "RestoreTrustCache"];

/// Policy knobs for `CompatibilityVerifier::verify` (spec §9 open
/// questions). Both open questions are decided here, defaulting to the
/// stricter behavior.
#[derive(Clone, Copy, Debug)]
pub struct VerifyOptions {
    /// When `true` (the default), a ticket whose IM4M signature does not
    /// verify is rejected outright. When `false`, verification continues
    /// and the caller gets `VerifyWarning::Im4mSignatureInvalid` instead.
    pub require_valid_im4m_signature: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        VerifyOptions { require_valid_im4m_signature: true }
    }
}

/// The result of a successful verification: always at least
/// ECID/nonce/identity compatible, plus whatever non-fatal warnings fired.
#[derive(Clone, Debug, Default)]
pub struct VerifyOutcome {
    pub warnings: Vec<VerifyWarning>,
}

/// Checks a `Ticket` against a live `DeviceSession` and a selected
/// `BuildIdentity` (spec §4.5). Actual IM4M signature cryptography is out
/// of scope for this crate (spec §1 Non-goals); `signature_valid` is
/// supplied by whatever collaborator performs that check.
pub struct CompatibilityVerifier {
    options: VerifyOptions,
}

impl CompatibilityVerifier {
    pub fn new(options: VerifyOptions) -> Self {
        CompatibilityVerifier { options }
    }

    /// Runs every compatibility check spec §4.5 calls for, in order:
    ///
    /// 1. mode precondition: `device.mode` must be `Recovery`, or `Dfu`
    ///    when `patched_dfu_requested` or `no_ibss` is set
    /// 2. ticket ECID must equal the live device ECID, downgradable to a
    ///    warning by `skip_blob`
    /// 3. ticket nonce must equal the device's live AP nonce, with a
    ///    generator-hash fallback when they differ (I1, B1)
    /// 4. build-identity match: a legacy ticket's ramdisk digest must
    ///    equal the selected identity's restore ramdisk digest; an image4
    ///    ticket's IM4M must authorize every digest the identity signs,
    ///    retried once ignoring `RestoreRamDisk`/`RestoreTrustCache`
    /// 5. SEP coherence -- see `verify_sep_coherence`, called separately
    ///    once the SEP payload has actually been fetched
    ///
    /// Plus the two policy-gated, non-fatal conditions: an unverified IM4M
    /// signature, and an install-kind fallback having fired.
    #[allow(clippy::too_many_arguments)]
    pub fn verify(
        &self,
        ticket: &Ticket,
        device: &DeviceInfo,
        patched_dfu_requested: bool,
        no_ibss: bool,
        live_ap_nonce: &[u8],
        identity: &BuildIdentity,
        identity_fallback: Option<(InstallKind, InstallKind)>,
        signature_valid: bool,
        skip_blob: bool,
    ) -> Result<VerifyOutcome, Error> {
        let mode_ok = match device.mode {
            Mode::Recovery => true,
            Mode::Dfu => patched_dfu_requested || no_ibss,
            _ => false,
        };
        if !mode_ok {
            return Err(Error::UnexpectedMode {
                wanted: "Recovery, or Dfu with the patched-DFU path or --no-ibss".to_string(),
                found: format!("{:?}", device.mode),
            });
        }

        let mut outcome = VerifyOutcome::default();

        if ticket.ecid != device.ecid {
            if skip_blob {
                warn!(
                    "ticket ECID {:#018x} does not match device ECID {:#018x}, proceeding because --skip-blob was set",
                    ticket.ecid, device.ecid
                );
                outcome.warnings.push(VerifyWarning::EcidMismatchIgnored { ticket_ecid: ticket.ecid, device_ecid: device.ecid });
            } else {
                return Err(Error::TicketMismatchEcid { ticket_ecid: ticket.ecid, device_ecid: device.ecid });
            }
        }

        if !nonce_matches(ticket, live_ap_nonce) {
            return Err(Error::TicketMismatchNonce);
        }

        if ticket.kind == TicketKind::Legacy {
            let restore_ramdisk_digest = identity.component("RestoreRamDisk").and_then(|e| e.digest.as_deref());
            if let (Some(ticket_digest), Some(restore_digest)) = (&ticket.ramdisk_digest, restore_ramdisk_digest) {
                if ticket_digest.as_slice() != restore_digest {
                    return Err(Error::TicketMismatchIdentity);
                }
            }
        } else if !identity_digests_match(ticket, identity, &[])
            && !identity_digests_match(ticket, identity, IDENTITY_DIGEST_RETRY_IGNORE)
        {
            return Err(Error::TicketMismatchIdentity);
        }

        if !signature_valid {
            if self.options.require_valid_im4m_signature {
                return Err(Error::BadTicket {
                    path: ticket.source_path.display().to_string(),
                    reason: "IM4M signature did not verify".to_string(),
                });
            }
            warn!("proceeding with an unverified IM4M signature for {}", ticket.source_path.display());
            outcome.warnings.push(VerifyWarning::Im4mSignatureInvalid);
        }

        if let Some((requested, used)) = identity_fallback {
            warn!("no BuildIdentity for requested install kind {:?}, falling back to {:?}", requested, used);
            outcome.warnings.push(VerifyWarning::InstallKindFallback { requested, used });
        }

        Ok(outcome)
    }

    /// Check 5 (spec §4.5): the SEP payload's hash must equal the SEP
    /// digest in the SEP build identity chosen for the same
    /// `(board, install-kind)`. Called once the orchestrator has actually
    /// fetched the SEP bytes (populate-components step), separately from
    /// `verify` since that payload isn't available any earlier. The hash
    /// algorithm is chosen by the digest's own length (spec I4), which is
    /// independent of `cache::hash_algorithm_for_chip`'s chip-family rule
    /// the Component Cache uses for its own cache-hit bookkeeping.
    pub fn verify_sep_coherence(&self, sep_identity: &BuildIdentity, sep_bytes: &[u8]) -> Result<(), Error> {
        let expected = sep_identity
            .component(crate::cache::SEP_COMPONENT)
            .and_then(|entry| entry.digest.as_deref())
            .ok_or_else(|| Error::ManifestMalformed("SEP missing Digest".into()))?;

        let algorithm = if expected.len() == 20 { HashAlgorithm::Sha1 } else { HashAlgorithm::Sha384 };
        let actual = cache::digest(sep_bytes, algorithm);
        if actual != expected {
            return Err(Error::DigestMismatch {
                what: "SEP coherence".to_string(),
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn ticket(ecid: u64, nonce: Vec<u8>) -> Ticket {
        Ticket {
            kind: TicketKind::Image4,
            ecid,
            nonce,
            generator: None,
            ramdisk_digest: None,
            raw_im4m: Vec::new(),
            source_path: PathBuf::from("test.shsh2"),
        }
    }

    fn device(ecid: u64) -> DeviceInfo {
        DeviceInfo { chip_id: 0x8015, board_id: 0x01, ecid, supports_image4: true, mode: Mode::Recovery }
    }

    fn empty_identity() -> BuildIdentity {
        BuildIdentity {
            ap_board_id: 0x01,
            ap_chip_id: 0x8015,
            variant: String::new(),
            install_kind: None,
            components: HashMap::new(),
        }
    }

    #[test]
    fn mode_precondition_rejects_normal_mode() {
        let verifier = CompatibilityVerifier::new(VerifyOptions::default());
        let t = ticket(1, vec![1, 2, 3]);
        let mut d = device(1);
        d.mode = Mode::Normal;
        let identity = empty_identity();
        let result = verifier.verify(&t, &d, false, false, &[1, 2, 3], &identity, None, true, false);
        assert!(matches!(result, Err(Error::UnexpectedMode { .. })));
    }

    #[test]
    fn dfu_mode_is_allowed_for_patched_dfu_path() {
        let verifier = CompatibilityVerifier::new(VerifyOptions::default());
        let t = ticket(1, vec![1, 2, 3]);
        let mut d = device(1);
        d.mode = Mode::Dfu;
        let identity = empty_identity();
        let result = verifier.verify(&t, &d, true, false, &[1, 2, 3], &identity, None, true, false);
        assert!(result.is_ok());
    }

    #[test]
    fn ecid_mismatch_is_rejected() {
        let verifier = CompatibilityVerifier::new(VerifyOptions::default());
        let t = ticket(1, vec![1, 2, 3]);
        let d = device(2);
        let identity = empty_identity();
        let result = verifier.verify(&t, &d, false, false, &[1, 2, 3], &identity, None, true, false);
        assert!(matches!(result, Err(Error::TicketMismatchEcid { .. })));
    }

    #[test]
    fn ecid_mismatch_becomes_warning_with_skip_blob() {
        let verifier = CompatibilityVerifier::new(VerifyOptions::default());
        let t = ticket(1, vec![1, 2, 3]);
        let d = device(2);
        let identity = empty_identity();
        let outcome = verifier.verify(&t, &d, false, false, &[1, 2, 3], &identity, None, true, true).unwrap();
        assert_eq!(outcome.warnings, vec![VerifyWarning::EcidMismatchIgnored { ticket_ecid: 1, device_ecid: 2 }]);
    }

    #[test]
    fn nonce_mismatch_is_rejected() {
        let verifier = CompatibilityVerifier::new(VerifyOptions::default());
        let t = ticket(1, vec![1, 2, 3]);
        let d = device(1);
        let identity = empty_identity();
        let result = verifier.verify(&t, &d, false, false, &[9, 9, 9], &identity, None, true, false);
        assert!(matches!(result, Err(Error::TicketMismatchNonce)));
    }

    #[test]
    fn generator_hash_matches_live_nonce_when_bnch_differs() {
        // spec.md scenario S2 ("Generator hax"): the ticket's BNCH differs
        // from the live nonce, but the generator hashes to it.
        let verifier = CompatibilityVerifier::new(VerifyOptions::default());
        let mut t = ticket(1, vec![0xff; 48]);
        let generator = 0xabcdef0123456789u64;
        t.generator = Some(generator);
        let live_nonce = cache::digest(&generator.to_le_bytes(), HashAlgorithm::Sha384);
        let d = device(1);
        let identity = empty_identity();
        let result = verifier.verify(&t, &d, false, false, &live_nonce, &identity, None, true, false);
        assert!(result.is_ok());
    }

    #[test]
    fn generator_present_but_wrong_still_fails() {
        let verifier = CompatibilityVerifier::new(VerifyOptions::default());
        let mut t = ticket(1, vec![0xff; 48]);
        t.generator = Some(0x1111111111111111);
        let d = device(1);
        let identity = empty_identity();
        let result = verifier.verify(&t, &d, false, false, &[9; 48], &identity, None, true, false);
        assert!(matches!(result, Err(Error::TicketMismatchNonce)));
    }

    #[test]
    fn invalid_signature_is_hard_error_by_default() {
        let verifier = CompatibilityVerifier::new(VerifyOptions::default());
        let t = ticket(1, vec![1, 2, 3]);
        let d = device(1);
        let identity = empty_identity();
        let result = verifier.verify(&t, &d, false, false, &[1, 2, 3], &identity, None, false, false);
        assert!(result.is_err());
    }

    #[test]
    fn invalid_signature_becomes_warning_when_relaxed() {
        let verifier = CompatibilityVerifier::new(VerifyOptions { require_valid_im4m_signature: false });
        let t = ticket(1, vec![1, 2, 3]);
        let d = device(1);
        let identity = empty_identity();
        let outcome = verifier.verify(&t, &d, false, false, &[1, 2, 3], &identity, None, false, false).unwrap();
        assert_eq!(outcome.warnings, vec![VerifyWarning::Im4mSignatureInvalid]);
    }

    #[test]
    fn install_kind_fallback_is_surfaced() {
        let verifier = CompatibilityVerifier::new(VerifyOptions::default());
        let t = ticket(1, vec![1, 2, 3]);
        let d = device(1);
        let identity = empty_identity();
        let outcome = verifier
            .verify(&t, &d, false, false, &[1, 2, 3], &identity, Some((InstallKind::Erase, InstallKind::Update)), true, false)
            .unwrap();
        assert_eq!(
            outcome.warnings,
            vec![VerifyWarning::InstallKindFallback { requested: InstallKind::Erase, used: InstallKind::Update }]
        );
    }

    #[test]
    fn build_identity_digest_mismatch_is_rejected() {
        let verifier = CompatibilityVerifier::new(VerifyOptions::default());
        let t = ticket(1, vec![1, 2, 3]);
        let d = device(1);
        let mut components = HashMap::new();
        components.insert(
            "KernelCache".to_string(),
            crate::manifest::ManifestEntry { path: None, digest: Some(vec![0xaa; 48]), bbcfg_download_digest: None },
        );
        let identity =
            BuildIdentity { ap_board_id: 0x01, ap_chip_id: 0x8015, variant: String::new(), install_kind: None, components };

        // The ticket's IM4M is empty, so `asn1::read_im4m_tag` can't find a
        // "KernelCache" property at all; an unauthorized component is not a
        // mismatch, so this must still succeed.
        let result = verifier.verify(&t, &d, false, false, &[1, 2, 3], &identity, None, true, false);
        assert!(result.is_ok());
    }

    #[test]
    fn sep_coherence_matches_digest() {
        let verifier = CompatibilityVerifier::new(VerifyOptions::default());
        let payload = b"sep firmware payload".to_vec();
        let expected = cache::digest(&payload, HashAlgorithm::Sha384);
        let mut components = HashMap::new();
        components.insert(
            crate::cache::SEP_COMPONENT.to_string(),
            crate::manifest::ManifestEntry { path: None, digest: Some(expected), bbcfg_download_digest: None },
        );
        let identity =
            BuildIdentity { ap_board_id: 0x01, ap_chip_id: 0x8015, variant: String::new(), install_kind: None, components };

        assert!(verifier.verify_sep_coherence(&identity, &payload).is_ok());
    }

    #[test]
    fn sep_coherence_rejects_mismatched_payload() {
        let verifier = CompatibilityVerifier::new(VerifyOptions::default());
        let mut components = HashMap::new();
        components.insert(
            crate::cache::SEP_COMPONENT.to_string(),
            crate::manifest::ManifestEntry { path: None, digest: Some(vec![0u8; 48]), bbcfg_download_digest: None },
        );
        let identity =
            BuildIdentity { ap_board_id: 0x01, ap_chip_id: 0x8015, variant: String::new(), install_kind: None, components };

        let result = verifier.verify_sep_coherence(&identity, b"not the right payload");
        assert!(matches!(result, Err(Error::DigestMismatch { .. })));
    }
}
