//! Data model for the restore manifest (spec §3): a `Manifest` is a parsed
//! `BuildManifest.plist`; a `BuildIdentity` is one `(board, install-kind)`
//! layout inside it; a `Component` is a single named firmware payload.

use crate::plist_ext;
use crate::Error;
use std::collections::HashMap;

/// Whether a restore erases user data or updates in place (spec §3, §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallKind {
    Erase,
    Update,
}

impl InstallKind {
    /// `Info.Variant` strings look like `"Customer Erase Install (IPSW)"` or
    /// `"Customer Upgrade Install (IPSW)"`; classify on the substring.
    fn from_variant(variant: &str) -> Option<Self> {
        let lower = variant.to_ascii_lowercase();
        if lower.contains("erase") {
            Some(InstallKind::Erase)
        } else if lower.contains("upgrade") || lower.contains("update") {
            Some(InstallKind::Update)
        } else {
            None
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            InstallKind::Erase => InstallKind::Update,
            InstallKind::Update => InstallKind::Erase,
        }
    }
}

/// One entry in a `BuildIdentity`'s `Manifest` dictionary: where to find a
/// component inside the archive, and the digest it must hash to (spec §3
/// I3).
#[derive(Clone, Debug, Default)]
pub struct ManifestEntry {
    pub path: Option<String>,
    pub digest: Option<Vec<u8>>,
    pub bbcfg_download_digest: Option<Vec<u8>>,
}

/// One concrete firmware layout for a `(board, install-kind)` pair (spec
/// §3).
#[derive(Clone, Debug)]
pub struct BuildIdentity {
    pub ap_board_id: u64,
    pub ap_chip_id: u64,
    pub variant: String,
    pub install_kind: Option<InstallKind>,
    pub components: HashMap<String, ManifestEntry>,
}

impl BuildIdentity {
    pub fn component(&self, name: &str) -> Option<&ManifestEntry> {
        self.components.get(name)
    }

    pub fn has_component(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }
}

/// A parsed `BuildManifest.plist` (spec §3).
#[derive(Clone, Debug)]
pub struct Manifest {
    pub build_identities: Vec<BuildIdentity>,
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let value = plist_ext::parse(bytes)?;
        let root = plist_ext::dict(&value, "manifest")?;
        let identities = plist_ext::get_array(root, "BuildIdentities")?;

        let mut build_identities = Vec::with_capacity(identities.len());
        for identity in identities {
            let identity = identity
                .as_dictionary()
                .ok_or_else(|| Error::ManifestMalformed("BuildIdentities entry is not a dictionary".into()))?;

            let ap_board_id = parse_hex_or_dec(&plist_ext::get_string(identity, "ApBoardID")?)?;
            let ap_chip_id = parse_hex_or_dec(&plist_ext::get_string(identity, "ApChipID")?)?;

            let info = plist_ext::get_dict(identity, "Info")?;
            let variant = plist_ext::get_string(info, "Variant").unwrap_or_default();
            let install_kind = InstallKind::from_variant(&variant);

            let manifest_dict = plist_ext::get_dict(identity, "Manifest")?;
            let mut components = HashMap::new();
            for (name, value) in manifest_dict.iter() {
                let entry_dict = match value.as_dictionary() {
                    Some(d) => d,
                    None => continue,
                };

                let digest = plist_ext::get_data(entry_dict, "Digest").ok().map(<[u8]>::to_vec);
                let bbcfg_download_digest = plist_ext::get_data(entry_dict, "BBCFG-DownloadDigest")
                    .ok()
                    .map(<[u8]>::to_vec);
                let path = entry_dict
                    .get("Info")
                    .and_then(plist::Value::as_dictionary)
                    .and_then(|info| info.get("Path"))
                    .and_then(plist::Value::as_string)
                    .map(str::to_owned);

                components.insert(name.clone(), ManifestEntry { path, digest, bbcfg_download_digest });
            }

            build_identities.push(BuildIdentity { ap_board_id, ap_chip_id, variant, install_kind, components });
        }

        Ok(Manifest { build_identities })
    }

    /// Selects the unique `BuildIdentity` for `(board, install_kind)` (spec
    /// §4.6 step 4). Per spec §8 B3, falls back once to the opposite
    /// install-kind if no direct match exists, and the caller is expected
    /// to surface the distinct compatibility warning documented in
    /// `verifier.rs` when that fallback fires.
    pub fn select_identity(
        &self,
        board: u64,
        install_kind: InstallKind,
    ) -> Result<(&BuildIdentity, bool), Error> {
        if let Some(identity) = self.find_identity(board, install_kind) {
            return Ok((identity, false));
        }

        if let Some(identity) = self.find_identity(board, install_kind.opposite()) {
            return Ok((identity, true));
        }

        Err(Error::ManifestMalformed(format!(
            "no BuildIdentity for board {:#x} in either install-kind",
            board
        )))
    }

    fn find_identity(&self, board: u64, install_kind: InstallKind) -> Option<&BuildIdentity> {
        self.build_identities
            .iter()
            .find(|id| id.ap_board_id == board && id.install_kind == Some(install_kind))
    }
}

fn parse_hex_or_dec(s: &str) -> Result<u64, Error> {
    let trimmed = s.trim();
    let result = if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        trimmed.parse::<u64>()
    };
    result.map_err(|e| Error::ManifestMalformed(format!("bad integer field {:?}: {}", s, e)))
}

/// A materialized firmware payload, ready to be sent to the device (spec
/// §3).
#[derive(Clone)]
pub struct Component {
    pub name: String,
    pub bytes: Vec<u8>,
    pub digest: Vec<u8>,
}

impl Component {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("size", &self.bytes.len())
            .field("digest", &hex::encode(&self.digest))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_kind_from_variant() {
        assert_eq!(InstallKind::from_variant("Customer Erase Install (IPSW)"), Some(InstallKind::Erase));
        assert_eq!(InstallKind::from_variant("Customer Upgrade Install (IPSW)"), Some(InstallKind::Update));
        assert_eq!(InstallKind::from_variant("Research"), None);
    }

    #[test]
    fn hex_and_decimal_parse() {
        assert_eq!(parse_hex_or_dec("0x0E").unwrap(), 0x0E);
        assert_eq!(parse_hex_or_dec("14").unwrap(), 14);
    }
}
