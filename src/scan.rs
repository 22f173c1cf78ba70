//! Scanning helpers for downloaded archives and CSV exports
//!
//! Both scanners hand each item to a callback. A callback returning
//! `Scan::SkipAll` stops the scan early and the scanner reports `Scan::SkipAll`;
//! a scan that reaches the end reports `Scan::Continue`.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use encoding_rs::Encoding;
use thiserror::Error;
use tracing::debug;

/// Errors raised by the scanners themselves
///
/// Callback errors pass through untouched; the callback's error type only needs
/// `From<ScanError>`.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The archive could not be opened
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The CSV input could not be read
    #[error("Failed to read CSV input: {0}")]
    Read(#[source] io::Error),

    /// The archive is not a readable zip file
    #[error("Invalid zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// A CSV record could not be parsed
    #[error("Invalid CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// Whether a scan should go on after the current item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    Continue,
    SkipAll,
}

/// Calls `visit` with the name and contents of every file in the zip archive at `path`
///
/// Members are visited in archive order.
///
/// # Arguments
/// * `path` - Zip file, typically one returned by `download`
/// * `visit` - Receives the member name and a reader over its uncompressed bytes
///
/// # Returns
/// * `Ok(Scan::Continue)` after every member was visited
/// * `Ok(Scan::SkipAll)` if `visit` stopped the scan
/// * `Err` from opening the archive, reading a member header, or `visit`
pub fn scan_zip<E, F>(path: &Path, mut visit: F) -> Result<Scan, E>
where
    E: From<ScanError>,
    F: FnMut(&str, &mut dyn Read) -> Result<Scan, E>,
{
    let file = File::open(path).map_err(|source| ScanError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(ScanError::from)?;
    debug!(path = %path.display(), members = archive.len(), "scanning zip archive");

    for i in 0..archive.len() {
        let mut member = archive.by_index(i).map_err(ScanError::from)?;
        let name = member.name().to_string();
        if visit(&name, &mut member)? == Scan::SkipAll {
            debug!(member = %name, "zip scan stopped");
            return Ok(Scan::SkipAll);
        }
    }
    Ok(Scan::Continue)
}

/// Splits CSV input into rows and calls `visit` with each row's index and fields
///
/// `encoding` names the text encoding of the input, `None` meaning UTF-8. Input
/// bytes that do not decode are replaced with U+FFFD. Every row must have as
/// many fields as the first one.
pub fn scan_csv<R, E, F>(mut reader: R, encoding: Option<&'static Encoding>, mut visit: F) -> Result<Scan, E>
where
    R: Read,
    E: From<ScanError>,
    F: FnMut(usize, &[String]) -> Result<Scan, E>,
{
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw).map_err(ScanError::Read)?;

    let encoding = encoding.unwrap_or(encoding_rs::UTF_8);
    let (text, malformed) = encoding.decode_without_bom_handling(&raw);
    if malformed {
        debug!(encoding = encoding.name(), "replaced malformed CSV input");
    }

    let mut rows = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(text.as_bytes());
    let mut record = csv::StringRecord::new();
    let mut fields = Vec::new();
    let mut index = 0;

    while rows.read_record(&mut record).map_err(ScanError::from)? {
        fields.clear();
        fields.extend(record.iter().map(str::to_string));
        if visit(index, &fields)? == Scan::SkipAll {
            debug!(row = index, "CSV scan stopped");
            return Ok(Scan::SkipAll);
        }
        index += 1;
    }
    Ok(Scan::Continue)
}
