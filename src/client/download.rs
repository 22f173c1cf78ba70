//! Saving responses to temporary files

use std::io;
use std::path::PathBuf;

use tracing::debug;

use super::{Client, ClientError};

/// GETs `url` through the client and copies the body to a kept temporary file
///
/// Only `200 OK` responses are accepted. The caller owns the returned file and is
/// responsible for removing it.
///
/// # Arguments
/// * `client` - Client with an active transaction
/// * `url` - URL to fetch, `file://` included
///
/// # Returns
/// * `Ok(PathBuf)` of the `crawl-*` file holding the body
/// * `Err(ClientError::UnexpectedStatus)` for anything but `200 OK`
pub async fn download(client: &Client, url: &str) -> Result<PathBuf, ClientError> {
    let mut response = client.get(url).await?;
    if response.status_code() != 200 {
        return Err(ClientError::UnexpectedStatus(response.status_code()));
    }

    let mut tmp = tempfile::Builder::new().prefix("crawl-").tempfile()?;
    io::copy(response.body_mut(), tmp.as_file_mut())?;
    let (_, path) = tmp.keep().map_err(|e| e.error)?;

    debug!(url, path = %path.display(), "downloaded");
    Ok(path)
}
