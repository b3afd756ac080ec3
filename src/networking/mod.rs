use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use reqwest::blocking::Client;
use reqwest::header;

use crate::config::{DEFAULT_USER_AGENT, UpgradeConfig};
use crate::error::{Result, UpgradeError};
use crate::release::ReleaseInfo;

/// Size of each read from the response body while streaming to disk.
pub const DOWNLOAD_CHUNK_SIZE: usize = 2 * 16 * 16 * 1024;

/// Receives `(downloaded, total)` while an archive streams in.
pub type DownloadCallback<'a> = Option<&'a mut dyn FnMut(u64, Option<u64>)>;

/// Everything the upgrade needs from the network.
pub trait RemoteSource {
    /// Fetch the release feed at `url`, newest first.
    fn fetch_releases(&self, url: &str) -> Result<Vec<ReleaseInfo>>;

    /// Stream `url` into `dest`, replacing any existing file. Returns the
    /// number of bytes written.
    fn download(&self, url: &str, dest: &Path, progress: DownloadCallback<'_>) -> Result<u64>;
}

#[derive(Clone)]
pub struct NetworkClient {
    list_client: Client,
    download_client: Client,
}

impl NetworkClient {
    pub fn new(list_timeout: Duration, download_timeout: Duration, user_agent: &str) -> Self {
        Self {
            list_client: build_client(list_timeout, user_agent),
            download_client: build_client(download_timeout, user_agent),
        }
    }

    pub fn from_config(config: &UpgradeConfig) -> Self {
        Self::new(
            config.release_list_timeout(),
            config.download_timeout(),
            &config.user_agent,
        )
    }
}

impl Default for NetworkClient {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(10),
            Duration::from_secs(10 * 60),
            DEFAULT_USER_AGENT,
        )
    }
}

fn build_client(timeout: Duration, user_agent: &str) -> Client {
    Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .build()
        .unwrap_or_else(|err| {
            warn!("network client: falling back to default HTTP client configuration ({err})");
            Client::new()
        })
}

impl RemoteSource for NetworkClient {
    fn fetch_releases(&self, url: &str) -> Result<Vec<ReleaseInfo>> {
        info!("releases: fetching {url}");
        let text = self
            .list_client
            .get(url)
            .header(header::ACCEPT, "application/json")
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.text())
            .map_err(|e| UpgradeError::network(url, e))?;
        let releases: Vec<ReleaseInfo> =
            serde_json::from_str(&text).map_err(|e| UpgradeError::json("release list", e))?;
        debug!("releases: {} entries from {url}", releases.len());
        Ok(releases)
    }

    fn download(&self, url: &str, dest: &Path, mut progress: DownloadCallback<'_>) -> Result<u64> {
        info!("download: {url} -> {}", dest.display());
        let mut response = self
            .download_client
            .get(url)
            .header(header::ACCEPT, "application/zip, application/octet-stream")
            .send()
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| UpgradeError::network(url, e))?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| UpgradeError::io("creating download directory", e))?;
        }
        let mut file = File::create(dest)
            .map_err(|e| UpgradeError::io(format!("creating {}", dest.display()), e))?;

        let total = response.content_length();
        let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE];
        let mut downloaded: u64 = 0;
        let mut last_tick = Instant::now();

        loop {
            let read = match response.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(dest);
                    return Err(UpgradeError::network(url, format!("stream error: {e}")));
                }
            };
            if let Err(e) = file.write_all(&buf[..read]) {
                drop(file);
                let _ = fs::remove_file(dest);
                return Err(UpgradeError::io(format!("writing {}", dest.display()), e));
            }
            downloaded += read as u64;

            if last_tick.elapsed() > Duration::from_millis(200) {
                if let Some(cb) = progress.as_deref_mut() {
                    cb(downloaded, total);
                }
                debug!("download: {downloaded} of {total:?} bytes");
                last_tick = Instant::now();
            }
        }

        file.flush()
            .map_err(|e| UpgradeError::io(format!("flushing {}", dest.display()), e))?;
        if let Some(cb) = progress.as_deref_mut() {
            cb(downloaded, total);
        }

        if let Some(total) = total
            && downloaded < total
        {
            let _ = fs::remove_file(dest);
            return Err(UpgradeError::network(
                url,
                format!("download incomplete: received {downloaded} of {total} bytes"),
            ));
        }

        info!("download: completed {} ({downloaded} bytes)", dest.display());
        Ok(downloaded)
    }
}
