use crate::session::Session;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL, LOCATION, SET_COOKIE, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::Client;
use std::time::Duration;
use url::Url;

pub const MAX_REDIRECT_HOPS: usize = 10;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";
const BROWSER_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

#[derive(Debug, Clone)]
pub struct PortalRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
    /// `Some` turns the request into a URL-encoded form POST.
    pub form: Option<Vec<(String, String)>>,
}

impl PortalRequest {
    pub fn get(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
            form: None,
        }
    }

    pub fn post_form(url: Url, form: Vec<(String, String)>) -> Self {
        Self {
            url,
            headers: Vec::new(),
            form: Some(form),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PortalReply {
    pub status: u16,
    pub location: Option<String>,
    pub set_cookies: Vec<String>,
    pub body: String,
}

impl PortalReply {
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }
}

/// One HTTP exchange, no redirect following, no cookie handling.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: PortalRequest) -> Result<PortalReply>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static(BROWSER_ACCEPT));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));

        let client = Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .default_headers(headers)
            .build()
            .context("failed to build portal HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: PortalRequest) -> Result<PortalReply> {
        let mut builder = match &request.form {
            Some(form) => self.client.post(request.url.clone()).form(form),
            None => self.client.get(request.url.clone()),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("request to {} failed", request.url))?;
        let status = response.status().as_u16();
        if status >= 500 {
            bail!("{} returned HTTP {status}", request.url);
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let set_cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();
        let body = response
            .text()
            .await
            .with_context(|| format!("failed to read body from {}", request.url))?;

        Ok(PortalReply {
            status,
            location,
            set_cookies,
            body,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub reply: PortalReply,
    pub final_url: Url,
    pub hops: usize,
}

/// Portal HTTP access with the session cookie jar threaded through every exchange.
pub struct PortalClient<T> {
    transport: T,
    session: Session,
}

impl<T: Transport> PortalClient<T> {
    pub fn new(transport: T, portal_url: &Url) -> Self {
        Self {
            transport,
            session: Session::new(portal_url),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn send(&mut self, mut request: PortalRequest) -> Result<PortalReply> {
        if let Some(cookie) = self.session.cookie_header(&request.url) {
            request = request.header("Cookie", cookie);
        }
        let reply = self.transport.send(request).await?;
        self.session
            .apply_set_cookies(reply.set_cookies.iter().map(String::as_str));
        Ok(reply)
    }

    pub async fn get(&mut self, url: &Url) -> Result<PortalReply> {
        self.send(PortalRequest::get(url.clone())).await
    }

    /// GET `start`, then follow `Location` by hand for up to [`MAX_REDIRECT_HOPS`].
    ///
    /// Running out of hops or meeting a redirect without `Location` is not an
    /// error: the last response reached is returned as-is.
    pub async fn fetch_following_redirects(&mut self, start: &Url) -> Result<Fetched> {
        let mut url = start.clone();
        let mut reply = self.get(&url).await?;
        let mut hops = 0;

        while reply.is_redirect() && hops < MAX_REDIRECT_HOPS {
            let Some(location) = reply.location.as_deref() else {
                break;
            };
            url = resolve_location(&url, location)?;
            reply = self.get(&url).await?;
            hops += 1;
        }

        Ok(Fetched {
            reply,
            final_url: url,
            hops,
        })
    }
}

/// Absolute locations are taken verbatim; anything else resolves against the
/// current URL's origin.
pub fn resolve_location(current: &Url, location: &str) -> Result<Url> {
    let location = location.trim();
    if location.starts_with("http") {
        return Url::parse(location).with_context(|| format!("invalid redirect target {location}"));
    }
    let origin = Url::parse(&current.origin().ascii_serialization())
        .with_context(|| format!("{current} has no usable origin"))?;
    origin
        .join(location)
        .with_context(|| format!("invalid redirect target {location}"))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Replays canned replies in order and records every request it sees.
    #[derive(Clone, Default)]
    pub struct ScriptedTransport {
        replies: Arc<Mutex<VecDeque<Result<PortalReply, String>>>>,
        pub requests: Arc<Mutex<Vec<PortalRequest>>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(self, status: u16, body: &str) -> Self {
            self.push(Ok(PortalReply {
                status,
                body: body.to_string(),
                ..PortalReply::default()
            }))
        }

        pub fn redirect(self, location: &str) -> Self {
            self.push(Ok(PortalReply {
                status: 302,
                location: Some(location.to_string()),
                ..PortalReply::default()
            }))
        }

        pub fn reply_with_cookies(self, status: u16, body: &str, cookies: &[&str]) -> Self {
            self.push(Ok(PortalReply {
                status,
                body: body.to_string(),
                set_cookies: cookies.iter().map(|c| c.to_string()).collect(),
                ..PortalReply::default()
            }))
        }

        pub fn fail(self, message: &str) -> Self {
            self.push(Err(message.to_string()))
        }

        pub fn push(self, reply: Result<PortalReply, String>) -> Self {
            self.replies.lock().unwrap().push_back(reply);
            self
        }

        pub fn recorded(&self) -> Vec<PortalRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: PortalRequest) -> Result<PortalReply> {
            self.requests.lock().unwrap().push(request);
            match self.replies.lock().unwrap().pop_front() {
                Some(Ok(reply)) => Ok(reply),
                Some(Err(message)) => Err(anyhow::anyhow!(message)),
                None => Err(anyhow::anyhow!("scripted transport exhausted")),
            }
        }
    }
}
