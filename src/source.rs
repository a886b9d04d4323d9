//! Turns an upload source into exactly one file on disk.
//!
//! Directories are zipped into a [`NamedTempFile`], so the archive is removed
//! when the [`PreparedSource`] is dropped on every exit path.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{DriveError, Result};

/// MIME type used for packaged directories.
pub const ZIP_MIME_TYPE: &str = "application/zip";

/// A file ready for upload, possibly backed by a temporary archive.
#[derive(Debug)]
pub struct PreparedSource {
    path: PathBuf,
    name: String,
    mime_type: String,
    archive: Option<NamedTempFile>,
}

impl PreparedSource {
    /// Local file whose bytes will be uploaded.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name to use on Drive.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Whether the upload file is a temporary archive of a directory.
    pub fn is_archive(&self) -> bool {
        self.archive.is_some()
    }

    /// Delete the temporary archive now, reporting any error.
    pub fn cleanup(mut self) -> io::Result<()> {
        match self.archive.take() {
            Some(archive) => {
                let path = archive.path().to_path_buf();
                archive.close()?;
                debug!(path = %path.display(), "Removed temporary archive");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Resolve `source` to a single uploadable file.
pub fn prepare<P: AsRef<Path>>(source: P) -> Result<PreparedSource> {
    let source = source.as_ref();
    if !source.exists() {
        return Err(DriveError::SourceNotFound(source.to_path_buf()));
    }

    let base_name = base_name(source);

    if source.is_dir() {
        info!(path = %source.display(), "Directory detected, zipping");
        let archive = zip_directory(source, &base_name)?;
        return Ok(PreparedSource {
            path: archive.path().to_path_buf(),
            name: format!("{}.zip", base_name),
            mime_type: ZIP_MIME_TYPE.to_string(),
            archive: Some(archive),
        });
    }

    let mime_type = mime_guess::from_path(source)
        .first_or_octet_stream()
        .to_string();

    Ok(PreparedSource {
        path: source.to_path_buf(),
        name: base_name,
        mime_type,
        archive: None,
    })
}

fn base_name(path: &Path) -> String {
    let named = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned());
    // `.` and `..` have no file name of their own.
    named
        .or_else(|| {
            std::path::absolute(path)
                .ok()
                .and_then(|p| p.canonicalize().ok())
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        })
        .unwrap_or_else(|| "upload".to_string())
}

/// Recursively archive `dir` into a temporary zip file.
///
/// Entry names are relative to `dir` and use `/` separators. Symlinks are not followed.
pub fn zip_directory(dir: &Path, base_name: &str) -> Result<NamedTempFile> {
    let archive = tempfile::Builder::new()
        .prefix(&format!("{}-", base_name))
        .suffix(".zip")
        .tempfile()?;

    let mut zip = ZipWriter::new(BufWriter::new(archive.reopen()?));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    let mut entries = 0usize;
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        let rel = match path.strip_prefix(dir) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let name = rel.to_string_lossy().replace('\\', "/");

        if entry.file_type().is_dir() {
            zip.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            debug!(entry = %name, "Adding to archive");
            zip.start_file(name, options)?;
            let mut f = File::open(path)?;
            io::copy(&mut f, &mut zip)?;
            entries += 1;
        }
    }

    zip.finish()?.flush()?;
    debug!(path = %archive.path().display(), files = entries, "Archive written");
    Ok(archive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_source() {
        let err = prepare("/nonexistent/upload/source").unwrap_err();
        assert!(matches!(err, DriveError::SourceNotFound(_)));
    }

    #[test]
    fn test_file_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("report.pdf");
        std::fs::write(&file, b"%PDF").unwrap();

        let prepared = prepare(&file).unwrap();
        assert_eq!(prepared.path(), file.as_path());
        assert_eq!(prepared.name(), "report.pdf");
        assert_eq!(prepared.mime_type(), "application/pdf");
        assert!(!prepared.is_archive());

        prepared.cleanup().unwrap();
        assert!(file.exists());
    }

    #[test]
    fn test_unknown_extension_is_octet_stream() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("blob.qqqz");
        std::fs::write(&file, b"x").unwrap();

        assert_eq!(prepare(&file).unwrap().mime_type(), "application/octet-stream");
    }
}
