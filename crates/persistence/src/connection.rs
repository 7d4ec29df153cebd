//! Storage account connection strings
//!
//! Supports the usual `key=value;` form with `AccountName`/`AccountKey`,
//! explicit `BlobEndpoint`/`QueueEndpoint`, `SharedAccessSignature` and the
//! `UseDevelopmentStorage=true` shortcut for the local emulator.

use std::collections::HashMap;

use persistence_core::{Error, Result};
use url::Url;

use crate::credential::{Credential, SharedKeyCredential};

/// Well-known account of the local storage emulator
pub const DEV_ACCOUNT_NAME: &str = "devstoreaccount1";

/// Well-known key of the local storage emulator
pub const DEV_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IOsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

const DEV_BLOB_ENDPOINT: &str = "http://127.0.0.1:10000/devstoreaccount1";
const DEV_QUEUE_ENDPOINT: &str = "http://127.0.0.1:10001/devstoreaccount1";
const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";
const DEFAULT_PROTOCOL: &str = "https";

/// Storage service addressed through a connection string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Blob,
    Queue,
}

impl ServiceKind {
    fn subdomain(self) -> &'static str {
        match self {
            ServiceKind::Blob => "blob",
            ServiceKind::Queue => "queue",
        }
    }
}

/// A parsed connection string
#[derive(Debug, Clone)]
pub struct ConnectionString {
    account_name: Option<String>,
    blob_endpoint: Option<Url>,
    queue_endpoint: Option<Url>,
    credential: Option<Credential>,
}

impl ConnectionString {
    pub fn parse(input: &str) -> Result<Self> {
        let mut pairs: HashMap<String, String> = HashMap::new();
        for part in input.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| Error::InvalidConfig {
                message: format!("malformed connection string segment {:?}", key_only(part)),
            })?;
            pairs.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        if pairs
            .get("usedevelopmentstorage")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        {
            return Ok(Self {
                account_name: Some(DEV_ACCOUNT_NAME.to_string()),
                blob_endpoint: Some(parse_endpoint(DEV_BLOB_ENDPOINT)?),
                queue_endpoint: Some(parse_endpoint(DEV_QUEUE_ENDPOINT)?),
                credential: Some(Credential::SharedKey(SharedKeyCredential::new(
                    DEV_ACCOUNT_NAME,
                    DEV_ACCOUNT_KEY,
                )?)),
            });
        }

        let account_name = pairs.get("accountname").cloned();
        let protocol = pairs
            .get("defaultendpointsprotocol")
            .map(String::as_str)
            .unwrap_or(DEFAULT_PROTOCOL);
        let suffix = pairs
            .get("endpointsuffix")
            .map(String::as_str)
            .unwrap_or(DEFAULT_ENDPOINT_SUFFIX);

        let endpoint = |key: &str, kind: ServiceKind| -> Result<Option<Url>> {
            match (pairs.get(key), &account_name) {
                (Some(explicit), _) => parse_endpoint(explicit).map(Some),
                (None, Some(account)) => parse_endpoint(&format!(
                    "{}://{}.{}.{}",
                    protocol,
                    account,
                    kind.subdomain(),
                    suffix
                ))
                .map(Some),
                (None, None) => Ok(None),
            }
        };
        let blob_endpoint = endpoint("blobendpoint", ServiceKind::Blob)?;
        let queue_endpoint = endpoint("queueendpoint", ServiceKind::Queue)?;

        let credential = match (
            pairs.get("accountkey"),
            pairs.get("sharedaccesssignature"),
            &account_name,
        ) {
            (Some(key), _, Some(account)) => Some(Credential::SharedKey(
                SharedKeyCredential::new(account.clone(), key)?,
            )),
            (Some(_), _, None) => {
                return Err(Error::InvalidConfig {
                    message: "AccountKey requires AccountName".to_string(),
                })
            }
            (None, Some(sas), _) => Some(Credential::Sas(sas.trim_start_matches('?').to_string())),
            (None, None, _) => None,
        };

        if blob_endpoint.is_none() && queue_endpoint.is_none() {
            return Err(Error::InvalidConfig {
                message: "connection string has neither AccountName nor service endpoints"
                    .to_string(),
            });
        }

        Ok(Self {
            account_name,
            blob_endpoint,
            queue_endpoint,
            credential,
        })
    }

    pub fn account_name(&self) -> Option<&str> {
        self.account_name.as_deref()
    }

    /// Endpoint of the given service
    pub fn endpoint(&self, kind: ServiceKind) -> Result<&Url> {
        let endpoint = match kind {
            ServiceKind::Blob => self.blob_endpoint.as_ref(),
            ServiceKind::Queue => self.queue_endpoint.as_ref(),
        };
        endpoint.ok_or_else(|| Error::InvalidConfig {
            message: format!("connection string has no {} endpoint", kind.subdomain()),
        })
    }

    /// Credential embedded in the connection string, if any
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }
}

fn parse_endpoint(value: &str) -> Result<Url> {
    let url = Url::parse(value).map_err(|e| Error::InvalidConfig {
        message: format!("invalid endpoint {:?}: {}", value, e),
    })?;
    if url.cannot_be_a_base() {
        return Err(Error::InvalidConfig {
            message: format!("endpoint {:?} is not a base URL", value),
        });
    }
    Ok(url)
}

/// Key part of a segment, so secrets never end up in error messages
fn key_only(segment: &str) -> &str {
    segment.split('=').next().unwrap_or(segment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_key_connection_string() {
        let parsed = ConnectionString::parse(&format!(
            "DefaultEndpointsProtocol=https;AccountName=myacct;AccountKey={};EndpointSuffix=core.windows.net",
            DEV_ACCOUNT_KEY
        ))
        .unwrap();

        assert_eq!(parsed.account_name(), Some("myacct"));
        assert_eq!(
            parsed.endpoint(ServiceKind::Blob).unwrap().as_str(),
            "https://myacct.blob.core.windows.net/"
        );
        assert_eq!(
            parsed.endpoint(ServiceKind::Queue).unwrap().as_str(),
            "https://myacct.queue.core.windows.net/"
        );
        assert!(matches!(parsed.credential(), Some(Credential::SharedKey(_))));
    }

    #[test]
    fn test_development_storage() {
        let parsed = ConnectionString::parse("UseDevelopmentStorage=true").unwrap();
        assert_eq!(parsed.account_name(), Some(DEV_ACCOUNT_NAME));
        assert_eq!(
            parsed.endpoint(ServiceKind::Queue).unwrap().as_str(),
            "http://127.0.0.1:10001/devstoreaccount1"
        );
    }

    #[test]
    fn test_sas_with_explicit_endpoints() {
        let parsed = ConnectionString::parse(
            "BlobEndpoint=https://blob.example.test/;SharedAccessSignature=?sv=2021-12-02&sig=x%3D",
        )
        .unwrap();

        assert!(parsed.account_name().is_none());
        assert!(matches!(parsed.credential(), Some(Credential::Sas(sas)) if sas == "sv=2021-12-02&sig=x%3D"));
        assert!(parsed.endpoint(ServiceKind::Blob).is_ok());
        assert!(matches!(
            parsed.endpoint(ServiceKind::Queue),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_endpoints_without_credential() {
        let parsed = ConnectionString::parse("AccountName=myacct").unwrap();
        assert!(parsed.credential().is_none());
    }

    #[test]
    fn test_malformed_segment_hides_value() {
        let err = ConnectionString::parse("AccountName=a;garbage").unwrap_err();
        assert!(err.to_string().contains("garbage"));

        let err = ConnectionString::parse("AccountKey=c2VjcmV0").unwrap_err();
        assert!(!err.to_string().contains("c2VjcmV0"));
    }

    #[test]
    fn test_missing_endpoints() {
        let result = ConnectionString::parse("SharedAccessSignature=sv=1");
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }
}
