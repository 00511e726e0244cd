//! HTTP client for the music-source API.

use super::models::{extract_extension, sanitize_url, value_to_string, LyricResult, UrlResult};
use super::UpstreamResolver;
use crate::config::UpstreamSettings;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info};

/// Constants baked into the upstream signature scheme. These must match
/// the values the upstream web player sends or requests are rejected.
const SIGN_HOSTNAME: &str = "music.gdstudio.xyz";
const SIGN_VERSION: &str = "20251104";

const USER_AGENT: &str =
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15";
const ACCEPT_IMAGE: &str = "image/avif,image/webp,image/apng,image/*,*/*;q=0.8";

/// Cover `param` sizes tried during cover download, largest first.
const COVER_SIZE_PARAMS: [&str; 4] = ["1000y1000", "640y640", "500y500", "300y300"];

pub(crate) fn md5_hex(input: &str) -> String {
    use md5::Digest;
    hex::encode(md5::Md5::digest(input.as_bytes()))
}

/// First nine decimal digits of the current unix time in milliseconds.
fn current_ts9() -> String {
    let millis = chrono::Utc::now().timestamp_millis().to_string();
    millis[..9].to_string()
}

/// Compute the upstream request signature: the upper-cased last eight hex
/// characters of md5("{hostname}|{version}|{ts9}|{escaped id}").
pub(crate) fn sign_request(id: &str, ts9: &str) -> String {
    let escaped: String = url::form_urlencoded::byte_serialize(id.as_bytes()).collect();
    let src = format!("{SIGN_HOSTNAME}|{SIGN_VERSION}|{ts9}|{escaped}");
    let full = md5_hex(&src);
    full[full.len() - 8..].to_ascii_uppercase()
}

/// Referer some CDNs require before serving cover bytes.
fn cover_referer(source: &str) -> Option<&'static str> {
    match source.trim().to_ascii_lowercase().as_str() {
        "netease" => Some("https://music.163.com/"),
        "qq" => Some("https://y.qq.com/"),
        "kuwo" => Some("https://www.kuwo.cn/"),
        _ => None,
    }
}

/// Search keyword ladder: "{title} {first artist}", then the bare title,
/// then the raw track id. Trimmed and deduped, empties dropped.
fn build_search_keywords(track_id: &str, title: &str, artist: &str) -> Vec<String> {
    let title = title.trim();
    let track_id = track_id.trim();

    let mut first_artist = artist.trim();
    for sep in ["/", ",", ";", "、"] {
        if let Some(idx) = first_artist.find(sep) {
            first_artist = first_artist[..idx].trim_end();
        }
    }

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut add = |value: String| {
        let value = value.trim().to_string();
        if !value.is_empty() && seen.insert(value.clone()) {
            out.push(value);
        }
    };

    if !title.is_empty() && !first_artist.is_empty() {
        add(format!("{title} {first_artist}"));
    }
    add(title.to_string());
    add(track_id.to_string());
    out
}

/// Pick aux ids from a search result list. Tie-break order: exact
/// track-id match, case-insensitive title match, first item with a
/// pic_id.
fn pick_aux_ids(items: &[Value], track_id: &str, title: &str) -> Option<(String, String)> {
    let title = title.trim();

    if !track_id.is_empty() {
        for item in items {
            if value_to_string(item.get("id")) != track_id {
                continue;
            }
            let pic_id = value_to_string(item.get("pic_id"));
            let lyric_id = value_to_string(item.get("lyric_id"));
            if !pic_id.is_empty() || !lyric_id.is_empty() {
                return Some((pic_id, lyric_id));
            }
        }
    }

    if !title.is_empty() {
        for item in items {
            let name = value_to_string(item.get("name"));
            if !name.eq_ignore_ascii_case(title) {
                continue;
            }
            let pic_id = value_to_string(item.get("pic_id"));
            let lyric_id = value_to_string(item.get("lyric_id"));
            if !pic_id.is_empty() || !lyric_id.is_empty() {
                return Some((pic_id, lyric_id));
            }
        }
    }

    for item in items {
        let pic_id = value_to_string(item.get("pic_id"));
        if !pic_id.is_empty() {
            return Some((pic_id, value_to_string(item.get("lyric_id"))));
        }
    }

    None
}

/// Build the candidate URL ladder for a cover download: the URL as-is,
/// the URL with its query stripped (some CDNs invalidate their own
/// params), then one variant per `param` size. An existing `param` value
/// goes to the front of the size list. Duplicates are dropped.
fn build_cover_candidates(raw_url: &str) -> Vec<String> {
    let Ok(parsed) = url::Url::parse(raw_url.trim()) else {
        return vec![raw_url.to_string()];
    };

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut add = |candidate: String| {
        if !candidate.is_empty() && seen.insert(candidate.clone()) {
            out.push(candidate);
        }
    };

    add(parsed.to_string());

    if parsed.query().is_some() {
        let mut no_query = parsed.clone();
        no_query.set_query(None);
        add(no_query.to_string());
    }

    let orig_param = parsed
        .query_pairs()
        .find(|(key, _)| key == "param")
        .map(|(_, value)| value.trim().to_string())
        .unwrap_or_default();

    let mut size_params: Vec<&str> = COVER_SIZE_PARAMS.to_vec();
    if !orig_param.is_empty() && orig_param != COVER_SIZE_PARAMS[0] {
        size_params.retain(|p| *p != orig_param);
        size_params.insert(0, orig_param.as_str());
    }

    for param in size_params {
        let mut with_param = parsed.clone();
        let others: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(key, _)| key != "param")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        {
            let mut pairs = with_param.query_pairs_mut();
            pairs.clear();
            for (key, value) in &others {
                pairs.append_pair(key, value);
            }
            pairs.append_pair("param", param);
        }
        add(with_param.to_string());
    }

    out
}

/// Client for the music-source API. Stateless aside from the reqwest
/// connection pool; safe to share behind an Arc.
pub struct GdClient {
    client: reqwest::Client,
    base_url: String,
    mirrors: HashMap<String, String>,
}

impl GdClient {
    pub fn new(settings: &UpstreamSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .expect("Failed to create HTTP client");

        let base_url = settings.base_url.trim_end_matches('/').to_string();
        let mirrors = settings
            .mirrors
            .iter()
            .map(|(name, url)| (name.clone(), url.trim_end_matches('/').to_string()))
            .collect();

        Self {
            client,
            base_url,
            mirrors,
        }
    }

    /// Select the API entry point for a source. Sources with a regional
    /// upstream route through the matching mirror when one is configured.
    fn select_base_url(&self, source: &str) -> &str {
        let mirror = match source.to_ascii_lowercase().as_str() {
            "migu" | "kugou" | "ximalaya" => self.mirrors.get("cn"),
            "joox" => self.mirrors.get("hk"),
            "qobuz" | "ytmusic" => self.mirrors.get("us"),
            _ => None,
        };
        mirror.map(String::as_str).unwrap_or(&self.base_url)
    }

    async fn get_api(&self, source: &str, query: &[(&str, &str)]) -> Result<Value> {
        let base_url = self.select_base_url(source);
        let response = self
            .client
            .get(format!("{base_url}/api.php"))
            .query(query)
            .send()
            .await
            .context("request failed")?;

        if response.status() != reqwest::StatusCode::OK {
            bail!("unexpected status code: {}", response.status().as_u16());
        }

        response.json().await.context("failed to parse response")
    }

    async fn resolve_cover_with_size(
        &self,
        source: &str,
        pic_id: &str,
        size: u32,
    ) -> Result<String> {
        debug!(source, pic_id, size, "resolving cover");

        let sig = sign_request(pic_id, &current_ts9());
        let size = size.to_string();
        let body = self
            .get_api(
                source,
                &[
                    ("types", "pic"),
                    ("source", source),
                    ("id", pic_id),
                    ("size", &size),
                    ("s", &sig),
                ],
            )
            .await?;

        let raw_url = body.get("url").and_then(Value::as_str).unwrap_or("");
        if raw_url.is_empty() {
            bail!("cover url not found");
        }

        let cover_url = sanitize_url(raw_url);
        debug!(url = %cover_url, "cover resolved");
        Ok(cover_url)
    }

    async fn search_tracks(&self, source: &str, keyword: &str) -> Result<Vec<Value>> {
        let body = self
            .get_api(
                source,
                &[
                    ("types", "search"),
                    ("source", source),
                    ("name", keyword),
                    ("count", "20"),
                    ("pages", "1"),
                ],
            )
            .await
            .context("search request failed")?;

        match body {
            Value::Array(items) => Ok(items),
            _ => bail!("search response is not a list"),
        }
    }
}

#[async_trait]
impl UpstreamResolver for GdClient {
    async fn resolve_url(&self, source: &str, track_id: &str, bitrate: u32) -> Result<UrlResult> {
        info!(source, track_id, bitrate, "resolving url");

        let sig = sign_request(track_id, &current_ts9());
        let br = bitrate.to_string();
        let body = self
            .get_api(
                source,
                &[
                    ("types", "url"),
                    ("source", source),
                    ("id", track_id),
                    ("br", &br),
                    ("s", &sig),
                ],
            )
            .await?;

        let raw_url = body.get("url").and_then(Value::as_str).unwrap_or("");
        if raw_url.is_empty() || raw_url == "err" {
            if let Some(msg) = body
                .get("msg")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|m| !m.is_empty())
            {
                bail!("url resolution failed: {msg}");
            }
            if let Some(err) = body
                .get("error")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|m| !m.is_empty())
            {
                bail!("url resolution failed: {err}");
            }
            if let Some(code) = body.get("code") {
                bail!("url resolution failed: code={code}");
            }
            bail!("url resolution failed: empty or error response");
        }

        let url = sanitize_url(raw_url);
        let result = UrlResult {
            extension: extract_extension(&url),
            bitrate: body.get("br").and_then(Value::as_f64).unwrap_or(0.0) as i64,
            size: body.get("size").and_then(Value::as_f64).unwrap_or(0.0) as i64,
            url,
        };

        info!(url = %result.url, bitrate = result.bitrate, extension = %result.extension, "url resolved");
        Ok(result)
    }

    async fn resolve_cover(&self, source: &str, pic_id: &str) -> Result<String> {
        if pic_id.is_empty() {
            return Ok(String::new());
        }

        // Size support differs per source; fall back from large to small.
        let mut last_err = None;
        for size in [1000, 640, 500, 300] {
            match self.resolve_cover_with_size(source, pic_id, size).await {
                Ok(cover_url) => return Ok(cover_url),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("cover url not found")))
    }

    async fn resolve_lyrics(&self, source: &str, lyric_id: &str) -> Result<Option<LyricResult>> {
        if lyric_id.is_empty() {
            return Ok(None);
        }

        debug!(source, lyric_id, "resolving lyrics");

        let sig = sign_request(lyric_id, &current_ts9());
        let body = self
            .get_api(
                source,
                &[
                    ("types", "lyric"),
                    ("source", source),
                    ("id", lyric_id),
                    ("s", &sig),
                ],
            )
            .await?;

        let lyric = body.get("lyric").and_then(Value::as_str).unwrap_or("");
        if lyric.is_empty() {
            bail!("lyrics not found");
        }

        let result = LyricResult {
            lyric: lyric.to_string(),
            translation: body
                .get("tlyric")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        };

        debug!(
            lyric_length = result.lyric.len(),
            has_translation = !result.translation.is_empty(),
            "lyrics resolved"
        );
        Ok(Some(result))
    }

    async fn resolve_aux_ids(
        &self,
        source: &str,
        track_id: &str,
        title: &str,
        artist: &str,
    ) -> Result<(String, String)> {
        let keywords = build_search_keywords(track_id, title, artist);
        if keywords.is_empty() {
            bail!("search keyword is empty");
        }

        let mut last_err = None;
        for keyword in &keywords {
            let items = match self.search_tracks(source, keyword).await {
                Ok(items) => items,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            if items.is_empty() {
                continue;
            }

            if let Some((pic_id, lyric_id)) = pick_aux_ids(&items, track_id, title) {
                debug!(source, track_id, %pic_id, %lyric_id, %keyword, "resolved aux ids");
                return Ok((pic_id, lyric_id));
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => bail!("aux ids not found from search"),
        }
    }

    async fn download_cover(&self, source: &str, cover_url: &str) -> Result<Vec<u8>> {
        if cover_url.is_empty() {
            return Ok(Vec::new());
        }

        let referer = cover_referer(source);
        let mut last_err = None;

        for candidate in build_cover_candidates(cover_url) {
            let mut request = self
                .client
                .get(&candidate)
                .header(reqwest::header::ACCEPT, ACCEPT_IMAGE);
            if let Some(referer) = referer {
                request = request.header(reqwest::header::REFERER, referer);
            }

            debug!(url = %candidate, "downloading cover");

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    last_err = Some(anyhow::Error::new(e).context("download failed"));
                    continue;
                }
            };
            if response.status() != reqwest::StatusCode::OK {
                debug!(url = %candidate, status = response.status().as_u16(), "cover download attempt failed");
                last_err = Some(anyhow::anyhow!(
                    "unexpected status code: {}",
                    response.status().as_u16()
                ));
                continue;
            }
            let bytes = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    last_err = Some(anyhow::Error::new(e).context("download failed"));
                    continue;
                }
            };
            if bytes.is_empty() {
                last_err = Some(anyhow::anyhow!("empty cover response"));
                continue;
            }

            debug!(url = %candidate, size = bytes.len(), "cover downloaded");
            return Ok(bytes.to_vec());
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("cover download failed")))
    }
}
