//! Connection validation input and the validation hook type.
//!
//! The server extracts credentials from the upgrade request once per
//! connection and hands them to the configured [`Validator`]. The validator
//! decides; this module never does.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::future::BoxFuture;
use percent_encoding::percent_decode_str;
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, COOKIE};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use url::form_urlencoded;

use crate::protocol::UserContext;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("validation failed: {0}")]
    Failed(String),
}

/// Credentials and request details offered to the validation hook.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationData {
    /// Query string parameters of the upgrade URL.
    pub params: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    /// Bearer token from the `Authorization` header.
    pub token: Option<String>,
    /// Basic credentials from the `Authorization` header.
    pub user: Option<String>,
    pub pass: Option<String>,
}

impl ValidationData {
    pub fn from_request(request: &Request) -> Self {
        Self::from_parts(request.uri().query(), request.headers())
    }

    pub fn from_parts(query: Option<&str>, headers: &HeaderMap) -> Self {
        let mut data = Self {
            params: query.map(parse_query).unwrap_or_default(),
            ..Self::default()
        };

        for value in headers.get_all(COOKIE) {
            if let Ok(raw) = value.to_str() {
                data.cookies.extend(parse_cookies(raw));
            }
        }

        if let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            match parse_authorization(auth) {
                Some(Credentials::Basic { user, pass }) => {
                    data.user = Some(user);
                    data.pass = Some(pass);
                }
                Some(Credentials::Bearer(token)) => data.token = Some(token),
                None => log::debug!("Ignoring unsupported Authorization scheme"),
            }
        }

        data
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn parse_cookies(raw: &str) -> impl Iterator<Item = (String, String)> + '_ {
    raw.split(';').filter_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let value = value.trim().trim_matches('"');
        let value = percent_decode_str(value).decode_utf8_lossy().into_owned();
        Some((name.to_string(), value))
    })
}

enum Credentials {
    Basic { user: String, pass: String },
    Bearer(String),
}

fn strip_scheme<'a>(header: &'a str, scheme: &str) -> Option<&'a str> {
    let prefix = header.get(..scheme.len())?;
    prefix
        .eq_ignore_ascii_case(scheme)
        .then(|| header[scheme.len()..].trim())
}

fn parse_authorization(header: &str) -> Option<Credentials> {
    let header = header.trim();
    if let Some(encoded) = strip_scheme(header, "basic ") {
        let decoded = STANDARD.decode(encoded).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        return Some(Credentials::Basic {
            user: user.to_string(),
            pass: pass.to_string(),
        });
    }
    strip_scheme(header, "bearer ").map(|token| Credentials::Bearer(token.to_string()))
}

/// Async validation hook.
///
/// `Ok(Some(ctx))` accepts the connection, `Ok(None)` rejects it, `Err` rejects
/// it and is reported to the server's error listeners.
pub type Validator = Arc<
    dyn Fn(ValidationData) -> BoxFuture<'static, Result<Option<UserContext>, ValidationError>>
        + Send
        + Sync,
>;

/// Wrap an async closure as a [`Validator`].
pub fn validator<F, Fut>(f: F) -> Validator
where
    F: Fn(ValidationData) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<UserContext>, ValidationError>> + Send + 'static,
{
    Arc::new(move |data| Box::pin(f(data)))
}
