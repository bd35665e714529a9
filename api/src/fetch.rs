//! Remote video download
//!
//! Streams the response body into a temp file so ffmpeg can seek in it. The
//! file is removed when the returned handle is dropped.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tempfile::NamedTempFile;
use url::Url;

use crate::error::{VivitError, VivitResult};

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Downloaded video kept on disk for the duration of one request.
#[derive(Debug)]
pub struct DownloadedVideo {
    file: NamedTempFile,
    pub size: u64,
}

impl DownloadedVideo {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

pub fn build_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(timeout)
        .user_agent(concat!("vivit/", env!("CARGO_PKG_VERSION")))
        .build()
}

pub async fn download_video(
    client: &reqwest::Client,
    url: &Url,
    max_bytes: u64,
) -> VivitResult<DownloadedVideo> {
    let mut response = client.get(url.clone()).send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(VivitError::download(format!("{url} returned HTTP {status}")));
    }

    if let Some(len) = response.content_length() {
        if len > max_bytes {
            return Err(too_large(url, max_bytes));
        }
    }

    let mut file = tempfile::Builder::new()
        .prefix("vivit-")
        .suffix(".video")
        .tempfile()
        .map_err(|e| VivitError::Internal(format!("failed to create temp file: {e}")))?;

    let mut size = 0u64;
    while let Some(chunk) = response.chunk().await? {
        size += chunk.len() as u64;
        if size > max_bytes {
            return Err(too_large(url, max_bytes));
        }
        file.write_all(&chunk)
            .map_err(|e| VivitError::Internal(format!("failed to buffer download: {e}")))?;
    }

    if size == 0 {
        return Err(VivitError::download(format!("{url} returned an empty body")));
    }

    file.flush()
        .map_err(|e| VivitError::Internal(format!("failed to buffer download: {e}")))?;

    tracing::debug!(%url, size, "downloaded video");
    Ok(DownloadedVideo { file, size })
}

fn too_large(url: &Url, max_bytes: u64) -> VivitError {
    VivitError::download(format!("{url} is larger than the {max_bytes} byte limit"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> reqwest::Client {
        build_client(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_download_writes_body_to_disk() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/clip.mp4", server.uri())).unwrap();
        let video = download_video(&client(), &url, 1 << 20).await.unwrap();

        assert_eq!(video.size, 4096);
        assert_eq!(std::fs::read(video.path()).unwrap(), vec![7u8; 4096]);
    }

    #[tokio::test]
    async fn test_temp_file_removed_on_drop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let video = download_video(&client(), &url, 1024).await.unwrap();
        let path = video.path().to_path_buf();
        assert!(path.exists());
        drop(video);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_non_success_status_is_download_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/missing.mp4", server.uri())).unwrap();
        let err = download_video(&client(), &url, 1024).await.unwrap_err();
        assert!(matches!(err, VivitError::Download(ref msg) if msg.contains("404")));
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 2048]))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let err = download_video(&client(), &url, 1024).await.unwrap_err();
        assert!(matches!(err, VivitError::Download(ref msg) if msg.contains("1024 byte limit")));
    }

    #[tokio::test]
    async fn test_empty_body_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let err = download_video(&client(), &url, 1024).await.unwrap_err();
        assert!(matches!(err, VivitError::Download(ref msg) if msg.contains("empty body")));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_download_error() {
        // Port 9 (discard) on localhost is closed in CI containers
        let url = Url::parse("http://127.0.0.1:9/video.mp4").unwrap();
        let err = download_video(&client(), &url, 1024).await.unwrap_err();
        assert!(matches!(err, VivitError::Download(_)));
    }
}
