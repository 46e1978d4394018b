//! Stream resolution: turn an operator-entered URL (playlist, Shoutcast v1
//! mount, or direct stream) into a URL that has been seen to serve audio.
//!
//! ```text
//!   resolve(url)
//!     ├── playlist?  fetch body → File=/m3u lines → candidates (file order)
//!     └── otherwise  [url]
//!   for each candidate
//!     ├── shoutcast fix   ".../"  →  ".../;"
//!     ├── try(url)        reachability probe → decode probe
//!     └── try(flipped)    http ↔ https, only if the first try failed
//! ```
//!
//! The network and ffmpeg probes sit behind [`StreamProbe`] so the decision
//! logic can be exercised without either.

use std::future::Future;
use std::path::PathBuf;

use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::config::ResolverConfig;
use crate::error::ResolveError;
use crate::playlist::PlaylistKind;

/// Anything that can turn a configured URL into a validated stream URL.
pub trait StreamResolver: Send + Sync {
    fn resolve(&self, url: &str) -> impl Future<Output = Result<String, ResolveError>> + Send;
}

/// Side-effecting checks the resolver relies on.
pub trait StreamProbe: Send + Sync {
    fn fetch_playlist(&self, url: &str) -> impl Future<Output = anyhow::Result<String>> + Send;
    /// GET with redirects, status in `[200, 400)` and an audio/mpegurl content type.
    fn check_reachable(&self, url: &str) -> impl Future<Output = Result<(), ResolveError>> + Send;
    /// Short decode run that must show an audio stream being mapped.
    fn check_audio(&self, url: &str) -> impl Future<Output = Result<(), ResolveError>> + Send;
}

/// Shoutcast v1 servers want a `;` after the mount path.
pub fn fix_shoutcast_v1(url: &str) -> String {
    if url.ends_with('/') && !url.ends_with(';') {
        format!("{url};")
    } else {
        url.to_string()
    }
}

/// `http://` ↔ `https://`; `None` for any other scheme.
pub fn flip_scheme(url: &str) -> Option<String> {
    if let Some(rest) = url.strip_prefix("http://") {
        Some(format!("https://{rest}"))
    } else {
        url.strip_prefix("https://")
            .map(|rest| format!("http://{rest}"))
    }
}

/// ffmpeg prints these to stderr once it has found and mapped an input stream.
pub fn stderr_shows_audio(output: &str) -> bool {
    output.contains("Stream mapping") || output.contains("Output #0") || output.contains("Audio:")
}

fn validate_url(url: &str) -> Result<(), ResolveError> {
    match reqwest::Url::parse(url) {
        Ok(parsed) if parsed.host_str().is_some_and(|h| !h.is_empty()) => Ok(()),
        _ => Err(ResolveError::InvalidUrl(url.to_string())),
    }
}

pub struct Resolver<P> {
    probe: P,
}

impl<P: StreamProbe> Resolver<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    async fn candidates(&self, url: &str) -> Result<Vec<String>, ResolveError> {
        let Some(kind) = PlaylistKind::detect(url) else {
            return Ok(vec![url.to_string()]);
        };
        info!("[resolver] {} looks like a {:?} playlist", url, kind);
        let body = match self.probe.fetch_playlist(url).await {
            Ok(body) => body,
            Err(e) => {
                warn!("[resolver] playlist fetch failed for {}: {:#}", url, e);
                return Err(ResolveError::NoStreamsInPlaylist(url.to_string()));
            }
        };
        let streams = kind.extract(&body);
        if streams.is_empty() {
            warn!("[resolver] no stream entries in playlist {}", url);
            return Err(ResolveError::NoStreamsInPlaylist(url.to_string()));
        }
        Ok(streams)
    }

    async fn try_url(&self, url: &str) -> Result<(), ResolveError> {
        if let Err(e) = self.probe.check_reachable(url).await {
            info!("[resolver] {}", e);
            return Err(e);
        }
        if let Err(e) = self.probe.check_audio(url).await {
            info!("[resolver] {}", e);
            return Err(e);
        }
        Ok(())
    }
}

impl<P: StreamProbe> StreamResolver for Resolver<P> {
    async fn resolve(&self, url: &str) -> Result<String, ResolveError> {
        let url = url.trim();
        info!("[resolver] resolving {}", url);
        validate_url(url)?;

        let candidates = self.candidates(url).await?;
        debug!("[resolver] {} candidate stream(s) for {}", candidates.len(), url);

        for candidate in &candidates {
            let test_url = fix_shoutcast_v1(candidate);
            if test_url != *candidate {
                debug!("[resolver] shoutcast v1 fix: {} -> {}", candidate, test_url);
            }
            info!("[resolver] testing candidate {}", test_url);
            if self.try_url(&test_url).await.is_ok() {
                info!("[resolver] working stream: {}", test_url);
                return Ok(test_url);
            }

            if let Some(flipped) = flip_scheme(&test_url) {
                info!("[resolver] retrying with flipped scheme: {}", flipped);
                if self.try_url(&flipped).await.is_ok() {
                    info!("[resolver] working stream: {}", flipped);
                    return Ok(flipped);
                }
            }
        }

        warn!("[resolver] no working stream for {}", url);
        Err(ResolveError::NoWorkingStream {
            url: url.to_string(),
        })
    }
}

impl<T: StreamResolver> StreamResolver for std::sync::Arc<T> {
    fn resolve(&self, url: &str) -> impl Future<Output = Result<String, ResolveError>> + Send {
        (**self).resolve(url)
    }
}

// ── production probe ──────────────────────────────────────────────────────────

/// reqwest for the HTTP checks, ffmpeg for the decode check.
pub struct HttpProbe {
    config: ResolverConfig,
    ffmpeg: Option<PathBuf>,
    /// Default client: no redirects, stock user agent.
    plain: Client,
    /// Browser-ish client used for probes and as the playlist fallback.
    client: Client,
}

impl HttpProbe {
    pub fn new(config: &ResolverConfig, ffmpeg: Option<PathBuf>) -> anyhow::Result<Self> {
        let plain = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            config: config.clone(),
            ffmpeg,
            plain,
            client,
        })
    }

    async fn fetch_text(client: &Client, url: &str) -> anyhow::Result<String> {
        let resp = client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {}", status);
        }
        Ok(resp.text().await?)
    }
}

impl StreamProbe for HttpProbe {
    async fn fetch_playlist(&self, url: &str) -> anyhow::Result<String> {
        match Self::fetch_text(&self.plain, url).await {
            Ok(body) => Ok(body),
            Err(e) => {
                debug!("[resolver] plain playlist fetch failed ({:#}), retrying with redirects", e);
                Self::fetch_text(&self.client, url).await
            }
        }
    }

    async fn check_reachable(&self, url: &str) -> Result<(), ResolveError> {
        let not_reachable = |reason: String| ResolveError::NotReachable {
            url: url.to_string(),
            reason,
        };

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| not_reachable(e.to_string()))?;

        let status = resp.status().as_u16();
        if !(200..400).contains(&status) {
            return Err(not_reachable(format!("HTTP {status}")));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !content_type.contains("audio") && !content_type.contains("mpegurl") {
            return Err(not_reachable(format!(
                "unexpected content type {content_type:?}"
            )));
        }

        // Live streams never end: read up to the cap, then hang up.
        let mut received = 0usize;
        let mut body = resp.bytes_stream();
        while received < self.config.read_cap_bytes {
            match body.next().await {
                Some(Ok(chunk)) => received += chunk.len(),
                Some(Err(e)) if received == 0 => return Err(not_reachable(e.to_string())),
                Some(Err(e)) => {
                    debug!("[resolver] read stopped after {} bytes: {}", received, e);
                    break;
                }
                None => break,
            }
        }
        debug!(
            "[resolver] {} reachable: HTTP {} {} ({} bytes read)",
            url, status, content_type, received
        );
        Ok(())
    }

    async fn check_audio(&self, url: &str) -> Result<(), ResolveError> {
        let invalid = |reason: String| ResolveError::NotValidAudio {
            url: url.to_string(),
            reason,
        };
        let ffmpeg = self
            .ffmpeg
            .as_ref()
            .ok_or_else(|| invalid("ffmpeg binary not found".to_string()))?;

        let seconds = self.config.probe_seconds.to_string();
        let child = tokio::process::Command::new(ffmpeg)
            .args(["-nostdin", "-user_agent", self.config.user_agent.as_str(), "-i", url])
            .args(["-t", seconds.as_str(), "-f", "null", "-"])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.config.probe_timeout(), child)
            .await
            .map_err(|_| {
                invalid(format!(
                    "decode probe timed out after {}s",
                    self.config.probe_timeout_secs
                ))
            })?
            .map_err(|e| invalid(format!("failed to run ffmpeg: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let snippet: String = stderr.chars().take(300).collect();
        debug!("[resolver] ffmpeg output snippet for {}: {}", url, snippet);

        if stderr_shows_audio(&stderr) {
            Ok(())
        } else {
            Err(invalid("no audio stream in decode output".to_string()))
        }
    }
}
