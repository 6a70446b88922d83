use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde::Deserialize;
use tempfile::TempPath;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{Result, ScanError};

pub const ZIP_CONTENT_TYPE: &str = "application/x-zip-compressed";

const CENTRAL_PACKAGES_FILE: &str = "Directory.Packages.props";
const CONVERTED_CSPROJ: &str = "converted.csproj";

/// Dependency manifests understood by the SCA engine.
const MANIFEST_NAMES: &[&str] = &[
    "package.json",
    "packages.config",
    "requirements.txt",
    "pom.xml",
    "composer.json",
    CENTRAL_PACKAGES_FILE,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackagingMode {
    /// Every file under the source root.
    #[default]
    Full,
    /// Dependency manifests only.
    Manifests,
}

/// A zip archive waiting to be submitted.
///
/// The file lives in the system temp directory and is deleted when the
/// value is dropped.
#[derive(Debug)]
pub struct Artifact {
    path: TempPath,
    file_name: String,
    size: u64,
}

impl Artifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name to present to the vendor, derived from the source directory.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn content_type(&self) -> &'static str {
        ZIP_CONTENT_TYPE
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.path()).await?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Packager {
    mode: PackagingMode,
}

impl Packager {
    pub fn new(mode: PackagingMode) -> Self {
        Self { mode }
    }

    #[instrument(skip(self), fields(mode = ?self.mode))]
    pub async fn package(&self, source_root: &Path) -> Result<Artifact> {
        let root = source_root.to_path_buf();
        let mode = self.mode;
        tokio::task::spawn_blocking(move || package_dir(&root, mode))
            .await
            .map_err(|e| ScanError::Packaging(format!("packaging task failed: {e}")))?
    }
}

/// Zip `root` into a temporary file.
pub fn package_dir(root: &Path, mode: PackagingMode) -> Result<Artifact> {
    if !root.is_dir() {
        return Err(ScanError::Packaging(format!(
            "source root {} does not exist or is not a directory",
            root.display()
        )));
    }

    let folder_name = root
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("source");

    let mut file = tempfile::Builder::new()
        .prefix("scangate-")
        .suffix(".zip")
        .tempfile()
        .map_err(|e| packaging_io("failed to create temporary archive", e))?;

    let entries = collect_entries(root, mode)?;
    if entries.is_empty() {
        return Err(ScanError::Packaging(format!(
            "no files to package under {}",
            root.display()
        )));
    }

    {
        let mut zip = ZipWriter::new(file.as_file_mut());
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for entry in &entries {
            zip.start_file(entry.name.as_str(), options)
                .map_err(|e| ScanError::Packaging(format!("failed to add {}: {e}", entry.name)))?;
            match &entry.source {
                EntrySource::File(path) => {
                    let shown = path.display();
                    let mut input = File::open(path)
                        .map_err(|e| packaging_io(&format!("failed to read {shown}"), e))?;
                    io::copy(&mut input, &mut zip)
                        .map_err(|e| packaging_io(&format!("failed to compress {shown}"), e))?;
                }
                EntrySource::Generated(content) => {
                    zip.write_all(content.as_bytes())
                        .map_err(|e| packaging_io(&format!("failed to write {}", entry.name), e))?;
                }
            }
        }
        zip.finish()
            .map_err(|e| ScanError::Packaging(format!("failed to finalize archive: {e}")))?;
    }

    let size = file
        .as_file()
        .metadata()
        .map_err(|e| packaging_io("failed to stat archive", e))?
        .len();
    debug!(entries = entries.len(), size, "archive written");

    Ok(Artifact {
        path: file.into_temp_path(),
        file_name: format!("{folder_name}.zip"),
        size,
    })
}

enum EntrySource {
    File(PathBuf),
    Generated(String),
}

struct Entry {
    name: String,
    source: EntrySource,
}

fn collect_entries(root: &Path, mode: PackagingMode) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();

    for item in WalkDir::new(root).sort_by_file_name() {
        let item = item.map_err(|e| {
            ScanError::Packaging(format!("failed to walk {}: {e}", root.display()))
        })?;
        if !item.file_type().is_file() {
            continue;
        }
        let path = item.path();
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let name = archive_name(relative);

        match mode {
            PackagingMode::Full => entries.push(Entry {
                name,
                source: EntrySource::File(path.to_path_buf()),
            }),
            PackagingMode::Manifests => {
                if let Some(entry) = manifest_entry(path, relative, name) {
                    entries.push(entry);
                }
            }
        }
    }

    Ok(entries)
}

/// Decide what, if anything, a file contributes to a manifest-only archive.
fn manifest_entry(path: &Path, relative: &Path, name: String) -> Option<Entry> {
    let file_name = path.file_name()?.to_str()?;
    if !is_manifest(file_name) {
        return None;
    }

    if file_name == CENTRAL_PACKAGES_FILE {
        let converted = fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|text| convert_central_packages(&text).map_err(|e| e.to_string()));
        return match converted {
            Ok(csproj) => {
                let dir = relative.parent().map(archive_name).unwrap_or_default();
                let name = if dir.is_empty() {
                    CONVERTED_CSPROJ.to_string()
                } else {
                    format!("{dir}/{CONVERTED_CSPROJ}")
                };
                Some(Entry {
                    name,
                    source: EntrySource::Generated(csproj),
                })
            }
            Err(e) => {
                warn!(
                    file = %path.display(),
                    error = %e,
                    "skipping unreadable central package file"
                );
                None
            }
        };
    }

    if file_name.ends_with(".csproj") {
        let versioned = fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|text| references_are_versioned(&text).map_err(|e| e.to_string()));
        return match versioned {
            Ok(true) => Some(Entry {
                name,
                source: EntrySource::File(path.to_path_buf()),
            }),
            Ok(false) => {
                warn!(
                    file = %path.display(),
                    "excluding project file with unversioned PackageReference"
                );
                None
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping unparsable project file");
                None
            }
        };
    }

    Some(Entry {
        name,
        source: EntrySource::File(path.to_path_buf()),
    })
}

pub fn is_manifest(file_name: &str) -> bool {
    MANIFEST_NAMES.contains(&file_name) || file_name.ends_with(".csproj")
}

fn archive_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn packaging_io(what: &str, err: io::Error) -> ScanError {
    ScanError::Packaging(format!("{what}: {err}"))
}

/// Rewrite a central package management file as a plain SDK project.
///
/// Every `<PackageVersion Include=".." Version=".."/>` becomes a
/// `<PackageReference>` with the same id and version.
pub fn convert_central_packages(props: &str) -> Result<String> {
    let mut reader = Reader::from_str(props);
    let mut references = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if e.local_name().as_ref() == b"PackageVersion" =>
            {
                let include = attribute(&e, b"Include")?;
                let version = attribute(&e, b"Version")?;
                match (include, version) {
                    (Some(include), Some(version)) => references.push((include, version)),
                    (include, _) => {
                        warn!(package = ?include, "PackageVersion without Include/Version ignored");
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(ScanError::Packaging(format!(
                    "invalid XML in {CENTRAL_PACKAGES_FILE} at byte {}: {e}",
                    reader.buffer_position()
                )));
            }
        }
    }

    let mut csproj = String::from(
        "<Project Sdk=\"Microsoft.NET.Sdk\">\n  \
         <PropertyGroup>\n    \
         <TargetFramework>netstandard2.0</TargetFramework>\n  \
         </PropertyGroup>\n  \
         <ItemGroup>\n",
    );
    for (include, version) in &references {
        csproj.push_str(&format!(
            "    <PackageReference Include=\"{}\" Version=\"{}\" />\n",
            escape(include.as_str()),
            escape(version.as_str())
        ));
    }
    csproj.push_str("  </ItemGroup>\n</Project>\n");
    Ok(csproj)
}

/// True when every `<PackageReference>` carries a `Version` attribute.
pub fn references_are_versioned(csproj: &str) -> Result<bool> {
    let mut reader = Reader::from_str(csproj);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if e.local_name().as_ref() == b"PackageReference" =>
            {
                if attribute(&e, b"Version")?.is_none() {
                    return Ok(false);
                }
            }
            Ok(Event::Eof) => return Ok(true),
            Ok(_) => {}
            Err(e) => {
                return Err(ScanError::Packaging(format!(
                    "invalid project XML at byte {}: {e}",
                    reader.buffer_position()
                )));
            }
        }
    }
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| ScanError::Packaging(format!("malformed attribute: {e}")))?;
        if attr.key.local_name().as_ref() == key {
            let value = attr
                .unescape_value()
                .map_err(|e| ScanError::Packaging(format!("malformed attribute value: {e}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}
