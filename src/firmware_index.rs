//! Firmware Index (spec §4.3): presents the release/beta/OTA catalogs and
//! resolves a `(model, selector)` pair to a download URL and build id.

use crate::external::DownloadTransport;
use crate::Error;
use std::sync::Arc;

/// Which of the three catalogs to consult (spec §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Catalog {
    Release,
    Beta,
    Ota,
}

/// The OS family a secondary beta catalog is keyed by (spec §4.3
/// fallback).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OsFamily {
    Ios,
    Ipados,
}

/// How a caller asks the index to pick a firmware version (spec §4.3).
#[derive(Clone, Debug)]
pub enum Selector {
    LatestSigned,
    ExactVersion(String),
    ExactBuild { build: String, beta: bool, ota: bool },
}

/// One entry in a catalog's version listing (spec §4.3).
#[derive(Clone, Debug)]
pub struct VersionDescriptor {
    pub version: String,
    pub build: String,
    pub url: String,
    pub is_beta: bool,
}

/// The `"[B]"` marker that excludes a beta entry from default-latest
/// selection (spec §4.3).
const BETA_MARKER: &str = "[B]";

pub struct FirmwareIndex {
    transport: Arc<dyn DownloadTransport>,
    release_url: String,
    beta_url: String,
    ota_url: String,
    secondary_beta_url_template: String,
}

impl FirmwareIndex {
    pub fn new(
        transport: Arc<dyn DownloadTransport>,
        release_url: impl Into<String>,
        beta_url: impl Into<String>,
        ota_url: impl Into<String>,
        secondary_beta_url_template: impl Into<String>,
    ) -> Self {
        FirmwareIndex {
            transport,
            release_url: release_url.into(),
            beta_url: beta_url.into(),
            ota_url: ota_url.into(),
            secondary_beta_url_template: secondary_beta_url_template.into(),
        }
    }

    fn catalog_url(&self, catalog: Catalog) -> &str {
        match catalog {
            Catalog::Release => &self.release_url,
            Catalog::Beta => &self.beta_url,
            Catalog::Ota => &self.ota_url,
        }
    }

    /// Lists every version descriptor for `model` in `catalog`. Beta
    /// entries whose version string contains `"[B]"` are excluded from the
    /// default-latest selection (spec §4.3); this function still returns
    /// them (tagged `is_beta`) so callers needing the full listing can see
    /// them, but `resolve`'s default-latest path filters them out.
    pub fn list_versions(&self, model: &str, catalog: Catalog) -> Result<Vec<VersionDescriptor>, Error> {
        let doc = self.transport.get_json(self.catalog_url(catalog))?;
        let entries = doc
            .get(model)
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::NoSuchVersion { model: model.to_string(), selector: "<any>".to_string() })?;

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let version = entry.get("version").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let build = entry.get("build").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let url = entry.get("url").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let is_beta = version.contains(BETA_MARKER);
            out.push(VersionDescriptor { version, build, url, is_beta });
        }
        Ok(out)
    }

    /// Resolves `(model, selector)` to a download URL and build id (spec
    /// §4.3).
    pub fn resolve(&self, model: &str, selector: &Selector) -> Result<(String, String), Error> {
        match selector {
            Selector::LatestSigned => {
                let versions = self.list_versions(model, Catalog::Release)?;
                let signed: Vec<_> = versions.iter().filter(|v| !v.is_beta).collect();
                if versions.iter().all(|v| v.is_beta) && !versions.is_empty() {
                    return Err(Error::NoSignedVersion { model: model.to_string() });
                }
                signed
                    .first()
                    .map(|v| (v.url.clone(), v.build.clone()))
                    .ok_or_else(|| Error::NoSuchVersion { model: model.to_string(), selector: "latest".to_string() })
            }
            Selector::ExactVersion(version) => {
                let versions = self.list_versions(model, Catalog::Release)?;
                versions
                    .into_iter()
                    .find(|v| &v.version == version)
                    .map(|v| (v.url, v.build))
                    .ok_or_else(|| Error::NoSuchVersion { model: model.to_string(), selector: version.clone() })
            }
            Selector::ExactBuild { build, beta, ota } => {
                let catalog = if *ota { Catalog::Ota } else if *beta { Catalog::Beta } else { Catalog::Release };
                let versions = self.list_versions(model, catalog)?;
                if let Some(found) = versions.iter().find(|v| &v.build == build) {
                    return Ok((found.url.clone(), found.build.clone()));
                }

                // Beta fallback: a secondary catalog keyed by OS family and
                // build id (spec §4.3).
                if *beta {
                    let family = if model.starts_with("iPad") { OsFamily::Ipados } else { OsFamily::Ios };
                    let family_str = match family {
                        OsFamily::Ios => "iOS",
                        OsFamily::Ipados => "iPadOS",
                    };
                    let url = self
                        .secondary_beta_url_template
                        .replace("{family}", family_str)
                        .replace("{build}", build);
                    let doc = self.transport.get_json(&url)?;
                    if let Some(download_url) = doc.get("url").and_then(|v| v.as_str()) {
                        return Ok((download_url.to_string(), build.clone()));
                    }
                }

                Err(Error::NoSuchVersion { model: model.to_string(), selector: build.clone() })
            }
        }
    }

    /// Downloads only the `BuildManifest.plist` member out of the remote
    /// archive at `url` via a partial ZIP read (spec §4.3).
    pub fn fetch_build_manifest(&self, url: &str, _model: &str, _build_id: &str) -> Result<Vec<u8>, Error> {
        self.transport
            .download_archive_member(url, "BuildManifest.plist")
            .map_err(|e| Error::DownloadFailed { what: "build manifest".to_string(), reason: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beta_marker_is_detected() {
        let descriptor = VersionDescriptor {
            version: "16.7.2 [B]".to_string(),
            build: "20H115".to_string(),
            url: String::new(),
            is_beta: "16.7.2 [B]".contains(BETA_MARKER),
        };
        assert!(descriptor.is_beta);
    }
}
