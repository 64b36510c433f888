//! # Firmware bundle reader
//!
//! A firmware bundle is a ZIP archive with a `manifest.json` member mapping
//! each contained image file to the target it is built for. A path that is
//! not a valid archive is treated as a single raw binary image by the caller.

use std::fmt::Display;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use zip::ZipArchive;

use crate::error::{Error, Result};

/// Manifest schema version understood by this reader
const MANIFEST_VERSION: u64 = 1;

/// A flashable destination, identified by the full triple
///
/// `platform` is `cf1`, `cf2` or `deck`; `target` is a symbolic name such as
/// "stm32", "nrf51" or a deck product name; `kind` is "fw", the only defined
/// value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Platform identifier: "cf1", "cf2" or "deck"
    pub platform: String,
    /// Symbolic target name
    pub target: String,
    /// Image kind, "fw" is the only defined value
    pub kind: String,
}

impl Target {
    /// Build a target descriptor from its parts
    pub fn new(platform: &str, target: &str, kind: &str) -> Self {
        Target {
            platform: platform.to_string(),
            target: target.to_string(),
            kind: kind.to_string(),
        }
    }

    /// The firmware target of the deck with the given product name
    pub fn deck_fw(name: &str) -> Self {
        Target::new("deck", name, "fw")
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.platform, self.target, self.kind)
    }
}

impl FromStr for Target {
    type Err = Error;

    // platform:target[:kind], kind defaults to "fw"
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(platform), Some(target), kind, None) if !platform.is_empty() && !target.is_empty() => {
                Ok(Target::new(platform, target, kind.unwrap_or("fw")))
            }
            _ => Err(Error::InvalidOperation(format!(
                "malformed target '{}', expected platform:target[:kind]",
                s
            ))),
        }
    }
}

/// Image bytes paired with the target they are built for
///
/// Artifacts are produced by the bundle reader and are immutable after
/// construction.
#[derive(Debug, Clone)]
pub struct FlashArtifact {
    /// Raw image bytes, read verbatim from the bundle
    pub content: Vec<u8>,
    /// Destination of the image
    pub target: Target,
}

#[derive(Deserialize)]
struct Manifest {
    version: u64,
    // serde_json is built with preserve_order so artifacts keep the
    // manifest's declaration order
    files: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct ManifestEntry {
    platform: String,
    target: String,
    #[serde(rename = "type")]
    kind: String,
}

/// Read the flash artifacts of a bundle
///
/// Returns one artifact per manifest entry, in the manifest's declaration
/// order. A path that is not a valid ZIP archive yields an empty list, the
/// caller upgrades this into a single raw-binary artifact when exactly one
/// target was requested.
///
/// # Errors
///
/// A valid archive without a `manifest.json`, a manifest that does not parse,
/// a manifest version other than 1, or a listed file missing from the archive
/// are all bundle format errors.
pub fn read_bundle(path: &Path) -> Result<Vec<FlashArtifact>> {
    let file = File::open(path)?;
    let mut archive = match ZipArchive::new(file) {
        Ok(archive) => archive,
        Err(_) => return Ok(Vec::new()),
    };

    let manifest: Manifest = {
        let entry = archive
            .by_name("manifest.json")
            .map_err(|_| Error::MissingManifest(path.to_path_buf()))?;
        serde_json::from_reader(entry)?
    };

    if manifest.version != MANIFEST_VERSION {
        return Err(Error::ManifestVersion(manifest.version));
    }

    let mut artifacts = Vec::with_capacity(manifest.files.len());
    for (file_name, metadata) in manifest.files {
        let entry: ManifestEntry = serde_json::from_value(metadata)?;
        let mut content = Vec::new();
        std::io::Read::read_to_end(&mut archive.by_name(&file_name)?, &mut content)?;
        tracing::debug!(file = %file_name, bytes = content.len(), "bundle artifact");
        artifacts.push(FlashArtifact {
            content,
            target: Target::new(&entry.platform, &entry.target, &entry.kind),
        });
    }

    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_bundle(manifest: &str, files: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = zip::ZipWriter::new(file.reopen().unwrap());
        writer
            .start_file("manifest.json", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(manifest.as_bytes()).unwrap();
        for (name, content) in files {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
        file
    }

    #[test]
    fn bundle_yields_artifacts_in_manifest_order() {
        let manifest = r#"{
            "version": 1,
            "files": {
                "cf2.bin": {"platform": "cf2", "target": "stm32", "type": "fw"},
                "deck.bin": {"platform": "deck", "target": "bcLighthouse4", "type": "fw"}
            }
        }"#;
        let bundle = write_bundle(manifest, &[("deck.bin", b"deck"), ("cf2.bin", b"stm")]);

        let artifacts = read_bundle(bundle.path()).unwrap();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].target, Target::new("cf2", "stm32", "fw"));
        assert_eq!(artifacts[0].content, b"stm");
        assert_eq!(artifacts[1].target, Target::deck_fw("bcLighthouse4"));
        assert_eq!(artifacts[1].content, b"deck");
    }

    #[test]
    fn wrong_manifest_version_is_rejected() {
        let manifest = r#"{"version": 2, "files": {}}"#;
        let bundle = write_bundle(manifest, &[]);

        let err = read_bundle(bundle.path()).unwrap_err();
        assert!(matches!(err, Error::ManifestVersion(2)));
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn archive_without_manifest_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = zip::ZipWriter::new(file.reopen().unwrap());
        writer
            .start_file("firmware.bin", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"image").unwrap();
        writer.finish().unwrap();

        let err = read_bundle(file.path()).unwrap_err();
        assert!(matches!(err, Error::MissingManifest(_)));
    }

    #[test]
    fn manifest_listing_a_missing_member_is_rejected() {
        let manifest = r#"{
            "version": 1,
            "files": {"gone.bin": {"platform": "cf2", "target": "stm32", "type": "fw"}}
        }"#;
        let bundle = write_bundle(manifest, &[]);

        let err = read_bundle(bundle.path()).unwrap_err();
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn raw_binary_yields_no_artifacts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a zip at all").unwrap();

        assert!(read_bundle(file.path()).unwrap().is_empty());
    }

    #[test]
    fn target_from_str_round_trips() {
        let target: Target = "deck:bcLighthouse4:fw".parse().unwrap();
        assert_eq!(target, Target::deck_fw("bcLighthouse4"));
        assert_eq!(target.to_string(), "deck:bcLighthouse4:fw");

        let short: Target = "cf2:stm32".parse().unwrap();
        assert_eq!(short, Target::new("cf2", "stm32", "fw"));

        assert!("stm32".parse::<Target>().is_err());
    }
}
