//! Broadcast status detection.
//!
//! Resolution order per poll: fetch the watch page, discover the program
//! status API from the page (or its referenced scripts), query the API
//! with up to three header variants, and fall back to an ordered chain of
//! HTML heuristics when the API path comes back `UNKNOWN`/`NOT_FOUND`.
//! A definite API result always wins over HTML phrase matches.

use crate::config::MonitorConfig;
use crate::error::RecorderError;
use chrono::{DateTime, Utc};
use livecap_common::BroadcastStatus;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::Url;
use std::time::Duration;
use tracing::{debug, warn};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const WATCH_TIMEOUT: Duration = Duration::from_secs(30);
const API_TIMEOUT: Duration = Duration::from_secs(12);

static SCRIPT_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<script[^>]+src="([^"]+)""#).unwrap());
static API_BASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https://[^"'\s&]+/v\d+/programs/"#).unwrap());
static STATUS_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""status"\s*:\s*"(ENDED|ON_AIR|RESERVED|TIMESHIFT)""#).unwrap());
static END_DATE_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""endDate"\s*:\s*"([^"]+)""#).unwrap());
static STRUCTURED_DATA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<script[^>]+type="application/(?:ld\+json|json)"[^>]*>(.*?)</script>"#)
        .unwrap()
});

/// Anti-JSON-hijacking prefixes stripped before parsing API bodies.
const JSON_GUARD_PREFIXES: &[&str] = &[")]}',", "throw 1; < don't be evil >"];

/// Watch-page phrases that indicate the broadcast has finished.
const ENDED_PHRASES: &[&str] = &[
    "タイムシフト非公開番組です",
    "タイムシフト再生中はコメントできません",
    "この番組は終了しました",
    "放送は終了",
    "配信は終了",
    "公開期間が終了",
    "視聴期間が終了",
    r#"data-status="ended""#,
    r#"data-status="endPublication""#,
    "endPublication",
];

/// Watch-page phrases that indicate the broadcast is still live.
const ON_AIR_PHRASES: &[&str] = &[
    "ただいま放送中",
    "ライブ配信",
    "視聴する",
    r#"isLiveBroadcast":true"#,
    r#""isLive":true"#,
    r#""status":"ON_AIR""#,
];

/// Source of broadcast status observations. Seam for the monitor loop.
pub trait StatusSource: Send + Sync {
    fn check(&self) -> Result<BroadcastStatus, RecorderError>;
}

/// Determines a broadcast's status from its public watch page and the
/// status API discovered from it.
pub struct StatusProbe {
    client: Client,
    watch_url: String,
    broadcast_id: String,
    frontend_origin: String,
    mobile_origin: String,
}

impl StatusProbe {
    pub fn new(config: &MonitorConfig, broadcast_id: &str) -> Result<Self, RecorderError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(WATCH_TIMEOUT)
            .build()
            .map_err(|e| RecorderError::Setup(format!("failed to build HTTP client: {}", e)))?;

        let watch_url = format!("{}{}", config.watch_base_url, broadcast_id);
        let base = Url::parse(&config.watch_base_url).map_err(|e| {
            RecorderError::Setup(format!(
                "invalid watch base URL {:?}: {}",
                config.watch_base_url, e
            ))
        })?;
        let host = base
            .host_str()
            .ok_or_else(|| RecorderError::Setup("watch base URL has no host".to_string()))?;
        let frontend_origin = format!("{}://{}", base.scheme(), host);
        let mobile_origin = format!("{}://sp.{}", base.scheme(), host);

        Ok(Self {
            client,
            watch_url,
            broadcast_id: broadcast_id.to_string(),
            frontend_origin,
            mobile_origin,
        })
    }

    fn fetch_watch_page(&self) -> Result<(String, Url), RecorderError> {
        let resp = self
            .client
            .get(&self.watch_url)
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            )
            .header("Accept-Language", "ja,en-US;q=0.9,en;q=0.8")
            .header("Cache-Control", "no-cache")
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| RecorderError::Network(e.to_string()))?;
        let final_url = resp.url().clone();
        let html = resp
            .text()
            .map_err(|e| RecorderError::Network(e.to_string()))?;
        Ok((html, final_url))
    }

    /// Find the program status API base, searching the page body first and
    /// then each referenced script body. Individual script fetch failures
    /// are skipped.
    fn discover_api_base(&self, html: &str, script_urls: &[Url]) -> Option<String> {
        if let Some(m) = API_BASE.find(html) {
            let api = m.as_str().to_string();
            debug!("API base found in page body: {}", api);
            return Some(api);
        }

        for url in script_urls {
            let body = match self
                .client
                .get(url.clone())
                .timeout(API_TIMEOUT)
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.text())
            {
                Ok(body) => body,
                Err(e) => {
                    debug!("Script fetch failed ({}): {}", url, e);
                    continue;
                }
            };
            if let Some(m) = API_BASE.find(&body) {
                let api = m.as_str().to_string();
                debug!("API base found in script {}: {}", url, api);
                return Some(api);
            }
        }
        None
    }

    /// Query the status API, trying each header variant until one returns
    /// a usable (non-404) response.
    fn read_status_from_api(&self, api_base: &str, referer: &str) -> BroadcastStatus {
        let api_url = format!("{}{}", api_base, self.broadcast_id);
        let variants = self.header_variants(referer);

        for (i, headers) in variants.iter().enumerate() {
            debug!("API attempt {}/{}: {}", i + 1, variants.len(), api_url);
            let mut request = self.client.get(&api_url).timeout(API_TIMEOUT);
            for (name, value) in headers {
                request = request.header(*name, value);
            }

            let resp = match request.send() {
                Ok(resp) => resp,
                Err(e) => {
                    debug!("API attempt {} failed: {}", i + 1, e);
                    continue;
                }
            };
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                debug!("API 404: {}", api_url);
                continue;
            }
            if !resp.status().is_success() {
                debug!("API attempt {} returned {}", i + 1, resp.status());
                continue;
            }
            let body = match resp.text() {
                Ok(body) => body,
                Err(e) => {
                    debug!("API body read failed: {}", e);
                    continue;
                }
            };
            if let Some(status) = parse_api_status_body(body.trim()) {
                debug!("API status: {}", status.as_str());
                return status;
            }
        }

        warn!("All API attempts failed: {}", api_url);
        BroadcastStatus::NotFound
    }

    fn header_variants(&self, referer: &str) -> Vec<Vec<(&'static str, String)>> {
        vec![
            // Desktop frontend
            vec![
                ("Referer", referer.to_string()),
                ("Origin", self.frontend_origin.clone()),
                ("Accept", "application/json".to_string()),
                ("X-Frontend-Id", "9".to_string()),
            ],
            // Mobile frontend
            vec![
                (
                    "Referer",
                    referer.replace(&self.frontend_origin, &self.mobile_origin),
                ),
                ("Origin", self.mobile_origin.clone()),
                ("Accept", "application/json".to_string()),
                ("X-Frontend-Id", "6".to_string()),
            ],
            // Minimal fallback, no Origin
            vec![
                ("Referer", referer.to_string()),
                ("Accept", "application/json".to_string()),
            ],
        ]
    }
}

impl StatusSource for StatusProbe {
    fn check(&self) -> Result<BroadcastStatus, RecorderError> {
        let (html, final_url) = self.fetch_watch_page()?;
        let script_urls = extract_script_srcs(&html, &final_url);

        let mut status = BroadcastStatus::Unknown;
        if let Some(api_base) = self.discover_api_base(&html, &script_urls) {
            status = self.read_status_from_api(&api_base, final_url.as_str());
        }

        Ok(resolve_with_html_fallback(status, &html))
    }
}

/// Extract `<script src=…>` URLs, resolved against the page URL.
pub fn extract_script_srcs(html: &str, base: &Url) -> Vec<Url> {
    SCRIPT_SRC
        .captures_iter(html)
        .filter_map(|caps| base.join(&caps[1]).ok())
        .collect()
}

fn strip_json_guard_prefixes(body: &str) -> &str {
    for prefix in JSON_GUARD_PREFIXES {
        if let Some(rest) = body.strip_prefix(prefix) {
            return rest.trim_start();
        }
    }
    body
}

/// Parse a status API response body: raw regex match first, then JSON
/// (after stripping hijacking guards) at `data.program.status` or
/// `program.status`.
pub fn parse_api_status_body(body: &str) -> Option<BroadcastStatus> {
    if let Some(caps) = STATUS_FIELD.captures(body) {
        return BroadcastStatus::parse(&caps[1]);
    }

    let stripped = strip_json_guard_prefixes(body);
    if stripped.starts_with('{') || stripped.starts_with('[') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(stripped) {
            let program = value
                .pointer("/data/program")
                .or_else(|| value.pointer("/program"));
            if let Some(status) = program
                .and_then(|p| p.get("status"))
                .and_then(|s| s.as_str())
            {
                return BroadcastStatus::parse(status);
            }
        }
    }
    None
}

/// A definite API status wins; HTML heuristics only fill in when the API
/// path yielded `UNKNOWN` or `NOT_FOUND`.
pub fn resolve_with_html_fallback(api_status: BroadcastStatus, html: &str) -> BroadcastStatus {
    if matches!(
        api_status,
        BroadcastStatus::Unknown | BroadcastStatus::NotFound
    ) {
        let inferred = infer_status_from_html(html);
        if inferred != BroadcastStatus::Unknown {
            return inferred;
        }
    }
    api_status
}

type HtmlDetector = fn(&str) -> Option<BroadcastStatus>;

/// Detector chain tried in order; the first definite answer wins.
const HTML_DETECTORS: &[(&str, HtmlDetector)] = &[
    ("structured-data", detect_structured_data),
    ("ended-phrase", detect_ended_phrase),
    ("on-air-phrase", detect_on_air_phrase),
];

/// Infer the status from the watch page HTML alone.
pub fn infer_status_from_html(html: &str) -> BroadcastStatus {
    for (name, detect) in HTML_DETECTORS {
        if let Some(status) = detect(html) {
            debug!("HTML detector {} matched: {}", name, status.as_str());
            return status;
        }
    }
    BroadcastStatus::Unknown
}

/// Structured-data blocks: a literal status field, or an `endDate` that
/// is already in the past.
fn detect_structured_data(html: &str) -> Option<BroadcastStatus> {
    for caps in STRUCTURED_DATA.captures_iter(html) {
        let blob = caps[1].trim();
        let value: serde_json::Value = match serde_json::from_str(blob) {
            Ok(value) => value,
            Err(_) => continue,
        };
        let text = value.to_string();

        if let Some(caps) = STATUS_FIELD.captures(&text) {
            return BroadcastStatus::parse(&caps[1]);
        }
        if let Some(caps) = END_DATE_FIELD.captures(&text) {
            let raw = caps[1].replace('Z', "+00:00");
            if let Ok(end) = DateTime::parse_from_rfc3339(&raw) {
                if end.timestamp() <= Utc::now().timestamp() {
                    return Some(BroadcastStatus::Ended);
                }
            }
        }
    }
    None
}

fn detect_ended_phrase(html: &str) -> Option<BroadcastStatus> {
    ENDED_PHRASES
        .iter()
        .any(|phrase| html.contains(phrase))
        .then_some(BroadcastStatus::Ended)
}

fn detect_on_air_phrase(html: &str) -> Option<BroadcastStatus> {
    ON_AIR_PHRASES
        .iter()
        .any(|phrase| html.contains(phrase))
        .then_some(BroadcastStatus::OnAir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_api_status_raw_regex() {
        let body = r#"{"meta":{"status":200},"data":{"program":{"status":"ON_AIR"}}}"#;
        assert_eq!(parse_api_status_body(body), Some(BroadcastStatus::OnAir));
    }

    #[test]
    fn test_parse_api_status_guarded_body() {
        let body = ")]}',\n{\"data\":{\"program\":{\"status\":\"ENDED\"}}}";
        assert_eq!(parse_api_status_body(body), Some(BroadcastStatus::Ended));
    }

    #[test]
    fn test_json_guard_prefixes_stripped() {
        assert_eq!(strip_json_guard_prefixes(")]}',\n{\"a\":1}"), "{\"a\":1}");
        assert_eq!(
            strip_json_guard_prefixes("throw 1; < don't be evil >{\"a\":1}"),
            "{\"a\":1}"
        );
        assert_eq!(strip_json_guard_prefixes("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn test_parse_api_status_program_at_top_level() {
        let body = r#"{"program":{"status":"RESERVED"}}"#;
        assert_eq!(
            parse_api_status_body(body),
            Some(BroadcastStatus::Reserved)
        );
    }

    #[test]
    fn test_parse_api_status_unrecognized() {
        assert_eq!(parse_api_status_body("<html>not json</html>"), None);
        assert_eq!(parse_api_status_body(r#"{"data":{}}"#), None);
    }

    #[test]
    fn test_api_precedence_over_html_phrases() {
        // The page contains an "ended" phrase, but the API said ON_AIR
        let html = r#"<html><body>この番組は終了しました</body></html>"#;
        assert_eq!(
            resolve_with_html_fallback(BroadcastStatus::OnAir, html),
            BroadcastStatus::OnAir
        );
    }

    #[test]
    fn test_html_fallback_when_api_not_found() {
        let html = r#"<html><body>この番組は終了しました</body></html>"#;
        assert_eq!(
            resolve_with_html_fallback(BroadcastStatus::NotFound, html),
            BroadcastStatus::Ended
        );
    }

    #[test]
    fn test_html_fallback_keeps_api_status_when_html_unknown() {
        let html = "<html><body>nothing relevant</body></html>";
        assert_eq!(
            resolve_with_html_fallback(BroadcastStatus::NotFound, html),
            BroadcastStatus::NotFound
        );
    }

    #[test]
    fn test_infer_on_air_phrase() {
        let html = r#"<html><body><span>ただいま放送中</span></body></html>"#;
        assert_eq!(infer_status_from_html(html), BroadcastStatus::OnAir);
    }

    #[test]
    fn test_structured_data_status_wins_over_phrases() {
        // The JSON-LD block carries ON_AIR; an ended phrase also appears,
        // but structured data is tried first.
        let html = concat!(
            r#"<script type="application/ld+json">{"status":"ON_AIR"}</script>"#,
            "この番組は終了しました"
        );
        assert_eq!(infer_status_from_html(html), BroadcastStatus::OnAir);
    }

    #[test]
    fn test_structured_data_past_end_date() {
        let html = r#"<script type="application/ld+json">
            {"@type":"BroadcastEvent","endDate":"2020-01-01T00:00:00+09:00"}
        </script>"#;
        assert_eq!(infer_status_from_html(html), BroadcastStatus::Ended);
    }

    #[test]
    fn test_structured_data_future_end_date_is_not_ended() {
        let html = r#"<script type="application/ld+json">
            {"@type":"BroadcastEvent","endDate":"2099-01-01T00:00:00Z"}
        </script>"#;
        assert_eq!(infer_status_from_html(html), BroadcastStatus::Unknown);
    }

    #[test]
    fn test_extract_script_srcs_resolves_relative() {
        let base = Url::parse("https://example.com/watch/lv1").unwrap();
        let html = r#"
            <script src="/assets/app.js"></script>
            <script type="text/javascript" src="https://cdn.example.com/lib.js"></script>
            <script>inline()</script>
        "#;
        let urls = extract_script_srcs(html, &base);
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0].as_str(), "https://example.com/assets/app.js");
        assert_eq!(urls[1].as_str(), "https://cdn.example.com/lib.js");
    }

    #[test]
    fn test_api_base_pattern() {
        let html = r#"var api = "https://api.example.com/v2/programs/";"#;
        assert_eq!(
            API_BASE.find(html).map(|m| m.as_str()),
            Some("https://api.example.com/v2/programs/")
        );
        // Query-string continuations are excluded by the pattern
        let entangled = r#"u=https://api.example.com/v2/programs/&x=1"#;
        assert_eq!(
            API_BASE.find(entangled).map(|m| m.as_str()),
            Some("https://api.example.com/v2/programs/")
        );
    }

    #[test]
    fn test_probe_construction_derives_origins() {
        let config = MonitorConfig::default();
        let probe = StatusProbe::new(&config, "lv123").unwrap();
        assert_eq!(probe.watch_url, "https://live.nicovideo.jp/watch/lv123");
        assert_eq!(probe.frontend_origin, "https://live.nicovideo.jp");
        assert_eq!(probe.mobile_origin, "https://sp.live.nicovideo.jp");
    }

    #[test]
    fn test_probe_network_failure_is_error() {
        // Nothing listens on this port; the probe must report the failure
        // instead of inventing a status.
        let config = MonitorConfig {
            watch_base_url: "http://127.0.0.1:9/watch/".to_string(),
            check_interval_secs: 1,
        };
        let probe = StatusProbe::new(&config, "lv123").unwrap();
        assert!(probe.check().is_err());
    }
}
