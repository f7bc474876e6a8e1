use std::error::Error as StdError;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{redirect, Client};
use url::Url;

use super::url_guard::{Refused, UrlGuard};
use crate::config::Config;
use crate::error::{AppError, Result};

#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL after redirects.
    pub final_url: Url,
    pub html: String,
}

/// Fetch collaborator used by the extraction worker.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub timeout: Duration,
    pub max_redirects: usize,
    pub max_body_bytes: usize,
    pub user_agent: String,
}

impl From<&Config> for FetchSettings {
    fn from(config: &Config) -> Self {
        Self {
            timeout: Duration::from_secs(config.fetch_timeout_secs),
            max_redirects: config.max_redirects,
            max_body_bytes: config.max_body_bytes,
            user_agent: config.user_agent.clone(),
        }
    }
}

/// HTTP fetcher guarded against SSRF at every step: before the request,
/// on each redirect hop, and in DNS resolution.
pub struct HttpFetcher {
    client: Client,
    guard: UrlGuard,
    settings: FetchSettings,
}

impl HttpFetcher {
    pub fn new(settings: FetchSettings) -> Result<Self> {
        Self::with_guard(settings, UrlGuard::new())
    }

    pub(crate) fn with_guard(settings: FetchSettings, guard: UrlGuard) -> Result<Self> {
        let redirect_guard = guard.clone();
        let max_redirects = settings.max_redirects;
        let policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > max_redirects {
                let hops = attempt.previous().len();
                attempt.error(format!("too many redirects ({hops})"))
            } else if let Err(e) = redirect_guard.check_url(attempt.url()) {
                attempt.error(Refused::from(e))
            } else {
                attempt.follow()
            }
        });

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9,*/*;q=0.5"),
        );

        // a proxy would resolve hosts itself, out of the guard's reach
        let client = Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(settings.user_agent.clone())
            .default_headers(headers)
            .redirect(policy)
            .dns_resolver(guard.resolver())
            .no_proxy()
            .build()?;

        Ok(Self {
            client,
            guard,
            settings,
        })
    }

    async fn download(&self, url: Url) -> Result<FetchedPage> {
        self.guard.check_resolved(&url).await?;

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::ExternalService(format!("HTTP {status} fetching {url}")));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(content_type) = &content_type {
            check_content_type(content_type)?;
        }

        let final_url = response.url().clone();
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(request_error)? {
            if body.len() + chunk.len() > self.settings.max_body_bytes {
                return Err(AppError::ExternalService(format!(
                    "response from {url} exceeds {} bytes",
                    self.settings.max_body_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchedPage {
            final_url,
            html: decode_body(&body, content_type.as_deref()),
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, raw_url: &str) -> Result<FetchedPage> {
        let url = Url::parse(raw_url)?;
        match tokio::time::timeout(self.settings.timeout, self.download(url)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(format!(
                "fetching {raw_url} took longer than {}s",
                self.settings.timeout.as_secs_f32()
            ))),
        }
    }
}

/// Sort a client error into the taxonomy. Guard refusals come back from
/// inside the client boxed somewhere in the source chain.
fn request_error(err: reqwest::Error) -> AppError {
    let mut cause = err.source();
    while let Some(inner) = cause {
        if let Some(Refused(reason)) = inner.downcast_ref::<Refused>() {
            return AppError::Blocked(reason.clone());
        }
        cause = inner.source();
    }
    if err.is_timeout() {
        AppError::Timeout(error_chain(&err))
    } else if err.is_redirect() {
        AppError::ExternalService(error_chain(&err))
    } else {
        AppError::Http(err)
    }
}

fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut cause = err.source();
    while let Some(inner) = cause {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        cause = inner.source();
    }
    message
}

fn check_content_type(content_type: &str) -> Result<()> {
    let content_type = content_type.to_ascii_lowercase();
    if content_type.contains("html") || content_type.contains("xml") || content_type.starts_with("text/") {
        Ok(())
    } else {
        Err(AppError::ExternalService(format!(
            "unsupported content type {content_type}"
        )))
    }
}

/// Bytes to text using, in order: a byte order mark, the `charset` of the
/// Content-Type header, a `<meta>` charset near the top of the document,
/// then UTF-8. Undecodable bytes become U+FFFD.
fn decode_body(body: &[u8], content_type: Option<&str>) -> String {
    let encoding = content_type
        .and_then(header_charset)
        .or_else(|| meta_charset(body))
        .unwrap_or(UTF_8);
    let (text, _, _) = encoding.decode(body);
    text.into_owned()
}

fn header_charset(content_type: &str) -> Option<&'static Encoding> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        Encoding::for_label(value.trim().trim_matches(['"', '\'']).as_bytes())
    })
}

/// Browsers only look this far for a `<meta>` charset.
const META_SNIFF_BYTES: usize = 1024;

fn meta_charset(body: &[u8]) -> Option<&'static Encoding> {
    static META_CHARSET: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = META_CHARSET
        .get_or_init(|| Regex::new(r#"(?i)<meta[^>]*?charset\s*=\s*["']?\s*([a-z0-9_:.\-]+)"#).ok())
        .as_ref()?;
    let head = String::from_utf8_lossy(&body[..body.len().min(META_SNIFF_BYTES)]);
    let label = pattern.captures(&head)?.get(1)?.as_str();
    Encoding::for_label(label.as_bytes())
}
