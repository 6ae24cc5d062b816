//! Ticket Store (spec §4.1): loads, parses, and indexes per-device signing
//! tickets.

use crate::asn1;
use crate::manifest::InstallKind;
use crate::plist_ext;
use crate::Error;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Whether a ticket's payload is an image4 `ApImg4Ticket` or a legacy
/// `APTicket` (SCAB) blob (spec §3, §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TicketKind {
    Image4,
    Legacy,
}

/// A loaded, parsed signing ticket (spec §3). Immutable once loaded.
#[derive(Clone, Debug)]
pub struct Ticket {
    pub kind: TicketKind,
    pub ecid: u64,
    pub nonce: Vec<u8>,
    pub generator: Option<u64>,
    pub ramdisk_digest: Option<Vec<u8>>,
    pub raw_im4m: Vec<u8>,
    pub source_path: PathBuf,
}

impl Ticket {
    fn from_plist_dict(dict: &plist::Dictionary, path: &Path) -> Result<Self, Error> {
        let (kind, raw_im4m) = if let Ok(data) = plist_ext::get_data(dict, "ApImg4Ticket") {
            (TicketKind::Image4, data.to_vec())
        } else if let Ok(data) = plist_ext::get_data(dict, "APTicket") {
            (TicketKind::Legacy, data.to_vec())
        } else {
            return Err(bad_ticket(path, "missing ApImg4Ticket/APTicket field"));
        };

        let (ecid, nonce) = match kind {
            TicketKind::Image4 => {
                let ecid = asn1::read_im4m_tag_u64(&raw_im4m, "ECID")
                    .map_err(|e| bad_ticket(path, &e.to_string()))?;
                let nonce = asn1::read_im4m_tag(&raw_im4m, "BNCH")
                    .map_err(|e| bad_ticket(path, &e.to_string()))?
                    .to_vec();
                (ecid, nonce)
            }
            TicketKind::Legacy => {
                let ecid = asn1::read_scab_tag_u64(&raw_im4m, 0x81)
                    .map_err(|e| bad_ticket(path, &e.to_string()))?;
                let nonce = asn1::read_scab_tag(&raw_im4m, 0x92)
                    .map_err(|e| bad_ticket(path, &e.to_string()))?
                    .to_vec();
                (ecid, nonce)
            }
        };

        let ramdisk_digest = if kind == TicketKind::Legacy {
            asn1::read_scab_tag(&raw_im4m, 0x9A).ok().map(<[u8]>::to_vec)
        } else {
            None
        };

        let generator = match plist_ext::get_string(dict, "generator") {
            Ok(raw) => Some(parse_generator(&raw).map_err(|e| bad_ticket(path, &e))?),
            Err(_) => None,
        };

        Ok(Ticket { kind, ecid, nonce, generator, ramdisk_digest, raw_im4m, source_path: path.to_path_buf() })
    }
}

fn bad_ticket(path: &Path, reason: &str) -> Error {
    Error::BadTicket { path: path.display().to_string(), reason: reason.to_string() }
}

/// Validates and parses a `generator` string of the form `0x%016x` (spec
/// §8 B2: shorter than 18 characters, or missing the `0x` prefix, is
/// rejected as malformed rather than silently truncated).
fn parse_generator(raw: &str) -> Result<u64, String> {
    if raw.len() < 18 || !raw.starts_with("0x") {
        return Err(format!("generator {:?} is not in 0x%016x format", raw));
    }
    u64::from_str_radix(&raw[2..], 16).map_err(|e| format!("generator {:?} is not valid hex: {}", raw, e))
}

/// Owns the set of loaded signing tickets for the current restore attempt
/// (spec §4.1).
#[derive(Default)]
pub struct TicketStore {
    tickets: Vec<Ticket>,
}

impl TicketStore {
    pub fn new() -> Self {
        TicketStore::default()
    }

    /// Loads each ticket file in `paths`, in order. Each file is read as
    /// possibly-gzipped bytes and parsed as a property list (spec §4.1).
    pub fn load<P: AsRef<Path>>(&mut self, paths: &[P], install_kind: InstallKind) -> Result<(), Error> {
        for path in paths {
            let path = path.as_ref();
            let ticket = Self::load_one(path, install_kind)?;
            self.tickets.push(ticket);
        }
        Ok(())
    }

    fn load_one(path: &Path, install_kind: InstallKind) -> Result<Ticket, Error> {
        let raw = fs::read(path).map_err(|e| bad_ticket(path, &format!("could not read file: {}", e)))?;

        let decompressed;
        let plist_bytes: &[u8] = if raw.starts_with(&[0x1f, 0x8b]) {
            let mut gz = flate2::read::GzDecoder::new(&raw[..]);
            let mut buf = Vec::new();
            gz.read_to_end(&mut buf).map_err(|e| bad_ticket(path, &format!("bad gzip stream: {}", e)))?;
            decompressed = buf;
            &decompressed
        } else {
            &raw
        };

        let value =
            plist_ext::parse(plist_bytes).map_err(|e| bad_ticket(path, &format!("not a property list: {}", e)))?;
        let mut dict = plist_ext::dict(&value, "ticket").map_err(|e| bad_ticket(path, &e.to_string()))?.clone();

        // If this is an "update" restore and the ticket carries an
        // `updateInstall` sub-dictionary, that sub-dictionary replaces the
        // outer one, carrying the `generator` field across (spec §4.1).
        if install_kind == InstallKind::Update {
            if let Some(update_install) = dict.get("updateInstall").and_then(plist::Value::as_dictionary) {
                let generator = dict.get("generator").cloned();
                let mut replacement = update_install.clone();
                if let Some(generator) = generator {
                    replacement.insert("generator".to_string(), generator);
                }
                dict = replacement;
            }
        }

        Ticket::from_plist_dict(&dict, path)
    }

    /// Stable order equal to load order (spec §4.1).
    pub fn iter(&self) -> impl Iterator<Item = &Ticket> {
        self.tickets.iter()
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    pub fn ecid_of(ticket: &Ticket) -> u64 {
        ticket.ecid
    }

    pub fn nonce_of(ticket: &Ticket) -> &[u8] {
        &ticket.nonce
    }

    pub fn ramdisk_digest_of(ticket: &Ticket) -> Option<&[u8]> {
        ticket.ramdisk_digest.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_requires_0x_prefix_and_length() {
        assert!(parse_generator("0xabcdef0123456789").is_ok());
        assert!(parse_generator("abcdef0123456789").is_err());
        assert!(parse_generator("0x12").is_err());
    }

    #[test]
    fn ticket_store_starts_empty() {
        let store = TicketStore::new();
        assert!(store.is_empty());
        assert_eq!(store.iter().count(), 0);
    }
}
