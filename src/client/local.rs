//! Synthetic responses for `file://` URLs

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::cache::ResponseHead;

/// RFC 1123 date as used in HTTP headers
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

fn http_date(time: impl Into<DateTime<Utc>>) -> String {
    time.into().format(HTTP_DATE).to_string()
}

/// Opens a local file and describes it as a `200 OK` response
pub(crate) fn file_response(path: &Path) -> io::Result<(ResponseHead, File)> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    let length = metadata.len();

    let mut head = ResponseHead {
        status: "200 OK".to_string(),
        status_code: 200,
        proto: "HTTP/1.1".to_string(),
        proto_major: 1,
        proto_minor: 1,
        headers: BTreeMap::new(),
        content_length: Some(length),
        transfer_encoding: Vec::new(),
        uncompressed: false,
    };
    head.add_header("Content-Type", "application/octet-stream");
    head.add_header("X-Content-Type-Options", "nosniff");
    head.add_header("Date", http_date(SystemTime::now()));
    head.add_header("Content-Length", length.to_string());
    if let Ok(modified) = metadata.modified() {
        head.add_header("Last-Modified", http_date(modified));
    }

    Ok((head, file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_http_date_format() {
        let time = Utc.with_ymd_and_hms(2023, 6, 28, 9, 5, 3).unwrap();
        assert_eq!(http_date(time), "Wed, 28 Jun 2023 09:05:03 GMT");
    }

    #[test]
    fn test_file_response_headers() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join("archive.zip");
        fs::write(&path, b"PK\x03\x04").unwrap();

        let (head, _file) = file_response(&path).expect("Should open file");

        assert_eq!(head.status_code, 200);
        assert_eq!(head.content_length, Some(4));
        assert_eq!(head.header("content-length"), Some("4"));
        assert_eq!(head.header("X-Content-Type-Options"), Some("nosniff"));
        assert!(head.header("Date").unwrap().ends_with("GMT"));
        assert!(head.header("Last-Modified").is_some());
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let result = file_response(&dir.path().join("missing"));
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
    }
}
