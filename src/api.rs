use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

pub trait TokenProvider: Send + Sync {
    /// The bearer token to attach, if the session has one.
    fn token(&self) -> Option<String>;
}

/// Token source for tests and anonymous clients.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("not authorized (HTTP {status})")]
    Unauthorized { status: u16 },
    #[error("api error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("{message}")]
    Rejected { message: String },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The server understood the request and refused it.
    Validation,
    /// 401/403; the user has to log in again.
    Unauthorized,
    /// The request never produced a usable response.
    Transport,
}

impl Error {
    pub fn rejected(message: impl Into<String>) -> Self {
        Error::Rejected {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Rejected { .. } => ErrorKind::Validation,
            Error::Unauthorized { .. } => ErrorKind::Unauthorized,
            Error::Transport(_) | Error::Http { .. } | Error::Decode(_) | Error::Url(_) => {
                ErrorKind::Transport
            }
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.kind() == ErrorKind::Unauthorized
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone)]
pub enum Body {
    Form(Vec<(String, String)>),
    Json(Value),
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

/// Response wrapper used by both the feed service (`status`/`message`) and the
/// upstream social API (`meta.code`/`meta.error_message`).
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl<T> Envelope<T> {
    pub fn check(&self) -> Result<()> {
        if let Some(status) = self.status.as_deref() {
            if status != "ok" {
                let message = self
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("request failed with status {status:?}"));
                return Err(Error::Rejected { message });
            }
        }
        if let Some(meta) = &self.meta {
            if meta.code >= 400 {
                let message = meta
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("request failed with code {}", meta.code));
                return Err(Error::Rejected { message });
            }
        }
        Ok(())
    }

    pub fn into_data(self) -> Result<T> {
        self.check()?;
        self.data
            .ok_or_else(|| Error::Decode("response envelope has no data".into()))
    }
}

pub struct Client {
    token_provider: Arc<dyn TokenProvider>,
    http: HttpClient,
    user_agent: String,
    base_url: Url,
}

impl Client {
    pub fn new(token_provider: Arc<dyn TokenProvider>, config: ClientConfig) -> Result<Self> {
        let mut base = config.base_url;
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)?;
        let http = match config.http_client {
            Some(client) => client,
            None => {
                let mut builder = HttpClient::builder();
                if let Some(timeout) = config.timeout {
                    builder = builder.timeout(timeout);
                }
                builder.build()?
            }
        };

        Ok(Client {
            token_provider,
            http,
            user_agent: config.user_agent,
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn get<T>(&self, path: &str, params: &[(String, String)]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.envelope::<T>(Method::GET, path, params, None)?
            .into_data()
    }

    pub fn post<T>(&self, path: &str, body: Option<Body>) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.envelope::<T>(Method::POST, path, &[], body)?
            .into_data()
    }

    pub fn put<T>(&self, path: &str, body: Option<Body>) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.envelope::<T>(Method::PUT, path, &[], body)?
            .into_data()
    }

    pub fn delete<T>(&self, path: &str) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.envelope::<T>(Method::DELETE, path, &[], None)?
            .into_data()
    }

    /// Issue a request whose envelope status matters but whose payload does
    /// not.
    pub fn execute(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        body: Option<Body>,
    ) -> Result<()> {
        self.envelope::<Value>(method, path, params, body)?.check()
    }

    pub fn envelope<T>(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        body: Option<Body>,
    ) -> Result<Envelope<T>>
    where
        T: DeserializeOwned,
    {
        let resp = self.request(method, path, params, body)?;
        let text = resp.text()?;
        if text.trim().is_empty() {
            return Ok(Envelope {
                status: None,
                data: None,
                message: None,
                meta: None,
            });
        }
        serde_json::from_str(&text).map_err(|err| Error::Decode(format!("{path}: {err}")))
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        body: Option<Body>,
    ) -> Result<Response> {
        let mut url = self.base_url.join(path.trim_start_matches('/'))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }

        log::debug!("api: {} {}", method, url);
        let mut req = self.http.request(method, url);
        req = req.header(USER_AGENT, self.user_agent.clone());
        if let Some(token) = self.token_provider.token() {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        match body {
            Some(Body::Form(form)) => {
                req = req.header(CONTENT_TYPE, "application/x-www-form-urlencoded");
                req = req.form(&form);
            }
            Some(Body::Json(value)) => {
                req = req.json(&value);
            }
            None => {}
        }

        let resp = req.send()?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Unauthorized {
                status: status.as_u16(),
            }),
            _ => Err(rejection_from_body(&body).unwrap_or(Error::Http {
                status: status.as_u16(),
                body,
            })),
        }
    }
}

// The feed service answers some refusals with a non-2xx status and a regular
// error envelope; surface its message rather than the raw body.
fn rejection_from_body(body: &str) -> Option<Error> {
    let envelope: Envelope<Value> = serde_json::from_str(body).ok()?;
    match envelope.check() {
        Err(err @ Error::Rejected { .. }) => Some(err),
        _ => None,
    }
}
