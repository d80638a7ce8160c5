//! `save_image`: download an image and store it under the download dir.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::descriptor::HttpMethod;
use crate::error::RelayError;
use crate::fetch::{Credentials, Fetcher, OutboundBody, OutboundRequest};
use crate::filetype;

/// Download `image_url` and write it to `dir`. Returns the file name used.
pub(crate) async fn save_image(
    fetcher: &dyn Fetcher,
    dir: &Path,
    image_url: &str,
    timeout: Duration,
) -> Result<String, RelayError> {
    if image_url.trim().is_empty() {
        return Err(RelayError::MissingUrl);
    }
    let request = OutboundRequest {
        method: HttpMethod::Get,
        url: image_url.to_string(),
        headers: Vec::new(),
        body: OutboundBody::Empty,
        credentials: Credentials::Omit,
    };
    let fetched = tokio::time::timeout(timeout, fetcher.fetch(request))
        .await
        .map_err(|_| RelayError::Timeout(timeout))??;
    if !(200..300).contains(&fetched.status) {
        return Err(RelayError::Network(format!(
            "download failed with HTTP {}",
            fetched.status
        )));
    }

    let name = file_name_from_url(image_url).unwrap_or_else(|| {
        let ext = filetype::detect(&fetched.body).map_or("bin", |kind| kind.ext);
        format!("image-{}.{ext}", Uuid::new_v4().simple())
    });

    tokio::fs::create_dir_all(dir).await?;
    let (name, mut file) = create_unused(dir, &name).await?;
    file.write_all(&fetched.body).await?;
    file.flush().await?;
    Ok(name)
}

/// Last path segment of the URL, restricted to a safe character set.
/// `None` when nothing usable with an extension remains.
fn file_name_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);
    let (_, tail) = path.rsplit_once('/')?;
    let name: String = tail
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    let name = name.trim_start_matches('.').to_string();
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(name),
        _ => None,
    }
}

/// Create `name`, or `stem-N.ext` for the first N not taken yet.
///
/// The file is claimed with `create_new`, so concurrent saves of the same
/// name each end up with their own file.
async fn create_unused(dir: &Path, name: &str) -> Result<(String, tokio::fs::File), RelayError> {
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    let mut n = 0u32;
    loop {
        let candidate = match (n, ext.is_empty()) {
            (0, _) => name.to_string(),
            (_, true) => format!("{stem}-{n}"),
            (_, false) => format!("{stem}-{n}.{ext}"),
        };
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(&candidate))
            .await;
        match opened {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e.into()),
        }
    }
}
