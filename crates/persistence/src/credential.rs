//! Request authorization: Shared Key signing, SAS tokens and bearer tokens
//!
//! Token acquisition itself is delegated to a [`TokenProvider`]; this module
//! only caches tokens and attaches them to requests.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use persistence_core::{Error, Result};
use sha2::Sha256;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::transport::HttpRequest;

type HmacSha256 = Hmac<Sha256>;

/// OAuth scope for Azure Storage data-plane access
pub const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";

/// Tokens this close to expiry are refreshed before use
const REFRESH_MARGIN_SECS: i64 = 300;

/// A bearer token and its expiry
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

/// Source of bearer tokens, e.g. a managed identity or service principal
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self, scope: &str) -> Result<AccessToken>;
}

/// Provider returning a fixed token, for emulators and tests
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self, _scope: &str) -> Result<AccessToken> {
        Ok(AccessToken {
            token: self.token.clone(),
            expires_on: Utc::now() + Duration::days(365),
        })
    }
}

/// Process-wide credential, initialized once on first use
static SHARED_CREDENTIAL: OnceCell<Arc<dyn TokenProvider>> = OnceCell::const_new();

/// Get the shared credential, running `init` on first use only
///
/// Concurrent first callers wait for a single initialization. A failed
/// initialization is not cached; the next caller tries again.
pub async fn shared_credential<F, Fut>(init: F) -> Result<Arc<dyn TokenProvider>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Arc<dyn TokenProvider>>>,
{
    SHARED_CREDENTIAL.get_or_try_init(init).await.cloned()
}

/// A credential bound to one scope, caching its token until near expiry
pub struct BearerTokenProvider {
    credential: Arc<dyn TokenProvider>,
    scope: String,
    cached: Mutex<Option<AccessToken>>,
}

impl BearerTokenProvider {
    pub fn new(credential: Arc<dyn TokenProvider>, scope: impl Into<String>) -> Self {
        Self {
            credential,
            scope: scope.into(),
            cached: Mutex::new(None),
        }
    }

    /// Current token, fetched from the credential when missing or expiring
    pub async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.expires_on - Utc::now() > Duration::seconds(REFRESH_MARGIN_SECS) {
                return Ok(token.token.clone());
            }
        }

        debug!(scope = %self.scope, "Refreshing bearer token");
        let token = self.credential.get_token(&self.scope).await?;
        let value = token.token.clone();
        *cached = Some(token);
        Ok(value)
    }
}

impl fmt::Debug for BearerTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerTokenProvider")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Account name and decoded account key for Shared Key signing
#[derive(Clone)]
pub struct SharedKeyCredential {
    account: String,
    key: Vec<u8>,
}

impl SharedKeyCredential {
    /// Create from the base64 account key found in connection strings
    pub fn new(account: impl Into<String>, key_base64: &str) -> Result<Self> {
        let key = STANDARD
            .decode(key_base64.trim())
            .map_err(|e| Error::InvalidConfig {
                message: format!("account key is not valid base64: {}", e),
            })?;
        Ok(Self {
            account: account.into(),
            key,
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Build the Shared Key string-to-sign for a request
    pub(crate) fn string_to_sign(&self, request: &HttpRequest) -> String {
        let content_length = match request.body.len() {
            0 => String::new(),
            n => n.to_string(),
        };

        let mut out = String::new();
        out.push_str(request.method.as_str());
        out.push('\n');
        for value in [
            request.header_str("content-encoding"),
            request.header_str("content-language"),
            content_length.as_str(),
            request.header_str("content-md5"),
            request.header_str("content-type"),
            request.header_str("date"),
            request.header_str("if-modified-since"),
            request.header_str("if-match"),
            request.header_str("if-none-match"),
            request.header_str("if-unmodified-since"),
            request.header_str("range"),
        ] {
            out.push_str(value);
            out.push('\n');
        }

        let mut ms_headers: Vec<(String, String)> = request
            .headers
            .iter()
            .filter(|(name, _)| name.as_str().starts_with("x-ms-"))
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or("").trim().to_string(),
                )
            })
            .collect();
        ms_headers.sort();
        for (name, value) in ms_headers {
            out.push_str(&name);
            out.push(':');
            out.push_str(&value);
            out.push('\n');
        }

        out.push('/');
        out.push_str(&self.account);
        out.push_str(request.url.path());

        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in request.url.query_pairs() {
            params
                .entry(name.to_lowercase())
                .or_default()
                .push(value.into_owned());
        }
        for (name, mut values) in params {
            values.sort();
            out.push('\n');
            out.push_str(&name);
            out.push(':');
            out.push_str(&values.join(","));
        }

        out
    }

    /// Compute the `Authorization` header value for a request
    pub(crate) fn sign(&self, request: &HttpRequest) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|e| Error::InvalidConfig {
            message: format!("invalid account key: {}", e),
        })?;
        mac.update(self.string_to_sign(request).as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());
        Ok(format!("SharedKey {}:{}", self.account, signature))
    }
}

impl fmt::Debug for SharedKeyCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKeyCredential")
            .field("account", &self.account)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// How requests to one account are authorized
#[derive(Clone)]
pub enum Credential {
    SharedKey(SharedKeyCredential),
    /// SAS query string, without the leading `?`
    Sas(String),
    Bearer(Arc<BearerTokenProvider>),
    Anonymous,
}

impl Credential {
    /// Attach authorization to a request that is otherwise final
    pub(crate) async fn authorize(&self, request: &mut HttpRequest) -> Result<()> {
        match self {
            Credential::SharedKey(key) => {
                let header = key.sign(request)?;
                request.set_header("authorization", &header)
            }
            Credential::Sas(sas) => {
                let query = match request.url.query() {
                    Some(existing) if !existing.is_empty() => format!("{}&{}", existing, sas),
                    _ => sas.clone(),
                };
                request.url.set_query(Some(&query));
                Ok(())
            }
            Credential::Bearer(provider) => {
                let token = provider.token().await?;
                request.set_header("authorization", &format!("Bearer {}", token))
            }
            Credential::Anonymous => Ok(()),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::SharedKey(key) => f.debug_tuple("SharedKey").field(key).finish(),
            Credential::Sas(_) => f.write_str("Sas(<redacted>)"),
            Credential::Bearer(provider) => f.debug_tuple("Bearer").field(provider).finish(),
            Credential::Anonymous => f.write_str("Anonymous"),
        }
    }
}
