//! Cache entry files and request fingerprints
//!
//! An entry file holds three consecutive segments:
//!
//! 1. the request descriptor, one line of compact JSON
//! 2. the response descriptor, one line of compact JSON
//! 3. the raw response body up to end of file
//!
//! Compact JSON never contains a raw newline, so each descriptor ends at the first
//! `\n` after it starts and the body begins right after the second one.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::CacheError;

/// Maximum number of payload bytes that take part in the fingerprint
pub const PAYLOAD_PREFIX_LEN: u64 = 256;

/// Number of digest bytes kept for the fingerprint (128 bits)
const FINGERPRINT_BYTES: usize = 16;

/// The narrow view of an outgoing request that the cache reads
pub trait RequestView {
    /// HTTP method, e.g. `GET`
    fn method(&self) -> &str;

    /// Full request URL
    fn url(&self) -> &str;

    /// Opens a fresh reader over the request body.
    ///
    /// Must not consume the body that will be transmitted. Returns `None` when the
    /// body cannot be re-opened (or there is none).
    fn open_body(&self) -> Option<io::Result<Box<dyn Read + '_>>>;
}

/// Request information stored at the head of every entry file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub method: String,
    pub url: String,
    /// At most the first 256 bytes of the request body
    #[serde(with = "payload_base64", default)]
    pub payload: Option<Vec<u8>>,
}

impl RequestDescriptor {
    /// Builds a descriptor from a request view, reading at most 256 payload bytes
    pub fn from_view<R: RequestView + ?Sized>(request: &R) -> Result<Self, CacheError> {
        Ok(Self {
            method: request.method().to_string(),
            url: request.url().to_string(),
            payload: payload_prefix(request)?,
        })
    }

    /// Hex-encoded 128-bit digest of method, URL and payload prefix
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_bytes());
        hasher.update(self.url.as_bytes());
        if let Some(payload) = &self.payload {
            hasher.update(payload);
        }
        let digest = hasher.finalize();
        hex::encode(&digest[..FINGERPRINT_BYTES])
    }
}

impl RequestView for RequestDescriptor {
    fn method(&self) -> &str {
        &self.method
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn open_body(&self) -> Option<io::Result<Box<dyn Read + '_>>> {
        self.payload
            .as_deref()
            .map(|payload| Ok(Box::new(payload) as Box<dyn Read + '_>))
    }
}

/// Response status line, headers and framing flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    /// Status text, e.g. `200 OK`
    pub status: String,
    pub status_code: u16,
    /// Protocol name, e.g. `HTTP/1.1`
    pub proto: String,
    pub proto_major: u8,
    pub proto_minor: u8,
    /// Header values keyed by lowercase header name
    pub headers: BTreeMap<String, Vec<String>>,
    /// `None` when the length was unknown
    pub content_length: Option<u64>,
    pub transfer_encoding: Vec<String>,
    /// Whether the body was transparently decompressed before storing
    pub uncompressed: bool,
}

impl ResponseHead {
    /// Returns the first value of a header, matching the name case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Appends a header value
    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }
}

/// A response loaded from a cache entry
///
/// `body` is an open file positioned at the first body byte. Dropping the response
/// closes it.
#[derive(Debug)]
pub struct CachedResponse {
    /// The request this response was stored for
    pub request: RequestDescriptor,
    pub head: ResponseHead,
    pub body: File,
}

impl CachedResponse {
    pub fn status_code(&self) -> u16 {
        self.head.status_code
    }

    /// Mutable access to the body stream
    pub fn body_mut(&mut self) -> &mut File {
        &mut self.body
    }

    /// Reads the remaining body into memory
    pub fn bytes(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.body.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Reads the remaining body as UTF-8, replacing invalid sequences
    pub fn text(&mut self) -> io::Result<String> {
        let bytes = self.bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Handle to the entry file for one request inside one transaction
#[derive(Debug, Clone)]
pub struct CacheEntry {
    request: RequestDescriptor,
    path: PathBuf,
}

impl CacheEntry {
    pub(crate) fn new(request: RequestDescriptor, dir: &Path) -> Self {
        let path = dir.join(request.fingerprint());
        Self { request, path }
    }

    /// Path of the entry file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The request descriptor this entry is keyed on
    pub fn request(&self) -> &RequestDescriptor {
        &self.request
    }

    /// Whether the entry file is present on disk
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Writes the request descriptor, the response head and the body to the entry file
    ///
    /// Data goes to a `.partial` file first and is renamed into place once the body
    /// has been copied completely.
    pub fn store<R: Read + ?Sized>(&self, head: &ResponseHead, body: &mut R) -> Result<(), CacheError> {
        let partial = self.path.with_extension("partial");
        if let Err(err) = self.write_partial(&partial, head, body) {
            warn!(path = %self.path.display(), error = %err, "failed to write cache entry");
            let _ = fs::remove_file(&partial);
            return Err(err);
        }
        fs::rename(&partial, &self.path).map_err(|e| CacheError::io(&self.path, e))?;
        debug!(path = %self.path.display(), url = %self.request.url, "stored cache entry");
        Ok(())
    }

    fn write_partial<R: Read + ?Sized>(
        &self,
        partial: &Path,
        head: &ResponseHead,
        body: &mut R,
    ) -> Result<(), CacheError> {
        let file = File::create(partial).map_err(|e| CacheError::io(partial, e))?;
        let mut writer = BufWriter::new(file);

        write_segment(&mut writer, &self.request, partial)?;
        write_segment(&mut writer, head, partial)?;
        io::copy(body, &mut writer).map_err(|e| CacheError::io(partial, e))?;
        writer.flush().map_err(|e| CacheError::io(partial, e))
    }

    /// Opens the entry file and returns the stored response with its body positioned
    /// at the first body byte
    pub fn load(&self) -> Result<CachedResponse, CacheError> {
        let file = File::open(&self.path).map_err(|e| CacheError::io(&self.path, e))?;
        let mut reader = BufReader::new(file);
        let mut offset = 0u64;

        let request: RequestDescriptor = read_segment(&mut reader, &mut offset, &self.path)?;
        let head: ResponseHead = read_segment(&mut reader, &mut offset, &self.path)?;

        let mut body = reader.into_inner();
        body.seek(SeekFrom::Start(offset))
            .map_err(|e| CacheError::io(&self.path, e))?;

        Ok(CachedResponse { request, head, body })
    }
}

fn write_segment<W: Write, T: Serialize>(writer: &mut W, value: &T, path: &Path) -> Result<(), CacheError> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).map_err(|e| CacheError::io(path, e))
}

fn read_segment<T: DeserializeOwned>(
    reader: &mut BufReader<File>,
    offset: &mut u64,
    path: &Path,
) -> Result<T, CacheError> {
    let mut line = Vec::new();
    let read = reader
        .read_until(b'\n', &mut line)
        .map_err(|e| CacheError::io(path, e))?;
    if line.last() != Some(&b'\n') {
        return Err(CacheError::Truncated(path.to_path_buf()));
    }
    *offset += read as u64;
    Ok(serde_json::from_slice(&line)?)
}

/// Reads at most `PAYLOAD_PREFIX_LEN` bytes from a fresh view of the request body
fn payload_prefix<R: RequestView + ?Sized>(request: &R) -> Result<Option<Vec<u8>>, CacheError> {
    let Some(body) = request.open_body() else {
        return Ok(None);
    };
    let body = body.map_err(CacheError::Payload)?;
    let mut prefix = Vec::with_capacity(PAYLOAD_PREFIX_LEN as usize);
    body.take(PAYLOAD_PREFIX_LEN)
        .read_to_end(&mut prefix)
        .map_err(CacheError::Payload)?;
    Ok(Some(prefix))
}

mod payload_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match payload {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
