//! Secret location strings.
//!
//! A location has the form `[PROVIDER:]<address>[!FORMAT][|JP:<path>]`.
//! The provider may be named explicitly by its code or recognized from the
//! shape of the address; the fallback for bare addresses is the local
//! filesystem.

use serde::{Deserialize, Serialize};

use super::format::ValueFormat;
use crate::error::{Error, Result};

/// Where a secret's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecretProviderKind {
    /// Remote secret store, addressed by identifier
    RemoteSecretStore,
    /// Remote parameter store, addressed by identifier
    RemoteParameterStore,
    /// Remote application-configuration service
    RemoteAppConfig,
    /// Remote blob store, addressed by identifier
    RemoteBlob,
    /// Local filesystem
    File,
    /// Another environment variable
    Env,
    /// JSON-path reference into the current config
    Config,
    /// Inline literal bytes
    Plain,
}

impl SecretProviderKind {
    /// The code used in explicit `PROVIDER:` prefixes.
    pub fn code(&self) -> &'static str {
        match self {
            SecretProviderKind::RemoteSecretStore => "REMOTE_SECRET_STORE",
            SecretProviderKind::RemoteParameterStore => "REMOTE_PARAMETER_STORE",
            SecretProviderKind::RemoteAppConfig => "REMOTE_APP_CONFIG",
            SecretProviderKind::RemoteBlob => "REMOTE_BLOB",
            SecretProviderKind::File => "FILE",
            SecretProviderKind::Env => "ENV",
            SecretProviderKind::Config => "CONFIG",
            SecretProviderKind::Plain => "PLAIN",
        }
    }

    fn from_code(code: &str) -> Option<SecretProviderKind> {
        match code {
            "REMOTE_SECRET_STORE" => Some(SecretProviderKind::RemoteSecretStore),
            "REMOTE_PARAMETER_STORE" => Some(SecretProviderKind::RemoteParameterStore),
            "REMOTE_APP_CONFIG" => Some(SecretProviderKind::RemoteAppConfig),
            "REMOTE_BLOB" => Some(SecretProviderKind::RemoteBlob),
            "FILE" => Some(SecretProviderKind::File),
            "ENV" => Some(SecretProviderKind::Env),
            "CONFIG" => Some(SecretProviderKind::Config),
            "PLAIN" => Some(SecretProviderKind::Plain),
            _ => None,
        }
    }

    /// Recognize a provider from the shape of a bare address.
    fn detect(address: &str) -> Option<SecretProviderKind> {
        if address.starts_with("file://") {
            return Some(SecretProviderKind::File);
        }
        if address.starts_with("ssm:") || matches_arn(address, "ssm:") {
            return Some(SecretProviderKind::RemoteParameterStore);
        }
        if matches_arn(address, "secretsmanager:") {
            return Some(SecretProviderKind::RemoteSecretStore);
        }
        if matches_arn(address, "s3:::") {
            return Some(SecretProviderKind::RemoteBlob);
        }
        // e.g. "aws:appconfig:app/env/profile"
        if let Some(colon) = address.find(':') {
            if address[colon + 1..].starts_with("appconfig:") {
                return Some(SecretProviderKind::RemoteAppConfig);
            }
        }
        None
    }
}

/// `arn:<partition>:<service>...` with any partition segment.
fn matches_arn(address: &str, service_prefix: &str) -> bool {
    let Some(rest) = address.strip_prefix("arn:") else {
        return false;
    };
    let Some(colon) = rest.find(':') else {
        return false;
    };
    rest[colon + 1..].starts_with(service_prefix)
}

/// Parsed form of a secret location string.
///
/// Cache identity is the full source string; the fetch key is
/// `(provider, address)`; the parse key adds the format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretLocation {
    /// The full, unmodified location string
    pub source: String,
    pub provider: SecretProviderKind,
    /// Provider-specific address with prefixes stripped
    pub address: String,
    /// Explicit `!FORMAT`, if present
    pub format: Option<ValueFormat>,
    /// `|JP:<path>` transform expression, if present
    pub json_path: Option<String>,
    /// The transform was `|SELF` (use the parsed value unchanged)
    pub self_transform: bool,
}

impl SecretLocation {
    /// Parse a location string.
    pub fn parse(source: &str) -> Result<SecretLocation> {
        let mut rest = source;

        let mut json_path = None;
        let mut self_transform = false;

        // The transform separator must not be the first character, and there
        // must be something after it.
        if let Some(sep) = rest.find('|') {
            if sep > 0 && sep < rest.len().saturating_sub(2) {
                let transform = &rest[sep + 1..];
                if let Some(path) = transform.strip_prefix("JP:") {
                    json_path = Some(path.to_string());
                    rest = &rest[..sep];
                } else if transform == "SELF" {
                    self_transform = true;
                    rest = &rest[..sep];
                } else {
                    return Err(Error::Resolution(format!(
                        "unknown transform '{transform}' in location '{source}'"
                    )));
                }
            }
        }

        let mut provider = None;
        if let Some(colon) = rest.find(':') {
            if let Some(kind) = SecretProviderKind::from_code(&rest[..colon]) {
                provider = Some(kind);
                rest = &rest[colon + 1..];
            }
        }

        // Explicit format suffix, e.g. "!json" (case-insensitive)
        let mut format = None;
        if let Some(bang) = rest.rfind('!') {
            if let Some(f) = ValueFormat::from_name(&rest[bang + 1..]) {
                format = Some(f);
                rest = &rest[..bang];
            }
        }

        let provider = provider
            .or_else(|| SecretProviderKind::detect(rest))
            .unwrap_or(SecretProviderKind::File);

        let address = match provider {
            SecretProviderKind::File => {
                rest.strip_prefix("file://").unwrap_or(rest).to_string()
            }
            _ => rest.to_string(),
        };

        if address.is_empty() && provider != SecretProviderKind::Plain {
            return Err(Error::Resolution(format!(
                "empty address in location '{source}'"
            )));
        }

        Ok(SecretLocation {
            source: source.to_string(),
            provider,
            address,
            format,
            json_path,
            self_transform,
        })
    }

    /// The cache key for raw fetches: identical `(provider, address)` pairs
    /// are fetched once per invocation, subject to TTL.
    pub fn fetch_key(&self) -> (SecretProviderKind, String) {
        (self.provider, self.address.clone())
    }
}
