//! Downstream service credentials.
//!
//! Each record-store service is reached with a base URL and HTTP Basic
//! credentials. They come from the `services` config block when present,
//! otherwise from the Cloud Foundry `VCAP_SERVICES` document, where the
//! binding name is looked up across every service class.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use url::Url;

use crate::config::ServicesConfig;
use crate::error::IngestError;

/// Environment variable holding the Cloud Foundry service bindings.
pub const VCAP_SERVICES: &str = "VCAP_SERVICES";

/// URL and Basic-Auth credentials of one service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCredentials {
    /// Base URL of the service
    pub url: String,

    /// Basic-Auth user
    #[serde(alias = "username")]
    pub user: String,

    /// Basic-Auth password
    pub password: String,
}

impl fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The three downstream services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Metadata,
    RawData,
    Location,
}

impl ServiceKind {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::RawData => "raw_data",
            Self::Location => "location",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated endpoint with a pre-encoded `Authorization` header.
#[derive(Clone)]
pub struct ResolvedCredentials {
    pub kind: ServiceKind,
    pub base_url: Url,
    auth_header: String,
}

impl ResolvedCredentials {
    /// Validates the URL and encodes the Basic-Auth header.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Credentials` if the URL does not parse or is
    /// not http(s).
    pub fn new(kind: ServiceKind, creds: &ServiceCredentials) -> Result<Self, IngestError> {
        let base_url = Url::parse(creds.url.trim()).map_err(|e| {
            IngestError::Credentials(format!("invalid {} url '{}': {}", kind, creds.url, e))
        })?;

        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(IngestError::Credentials(format!(
                "{} url must be http or https, got '{}'",
                kind,
                base_url.scheme()
            )));
        }

        let token = STANDARD.encode(format!("{}:{}", creds.user, creds.password));

        Ok(Self {
            kind,
            base_url,
            auth_header: format!("Basic {}", token),
        })
    }

    /// Value of the `Authorization` header.
    pub fn auth_header(&self) -> &str {
        &self.auth_header
    }

    /// Base URL joined with `path`, keeping any path the base already has.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl fmt::Debug for ResolvedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredentials")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url.as_str())
            .field("auth_header", &"<redacted>")
            .finish()
    }
}

/// Credentials for all three services.
#[derive(Debug, Clone)]
pub struct ServiceEndpoints {
    pub metadata: ResolvedCredentials,
    pub raw_data: ResolvedCredentials,
    pub location: ResolvedCredentials,
}

/// Resolves service credentials from config and `VCAP_SERVICES`.
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    services: ServicesConfig,
    vcap: Option<JsonValue>,
}

impl CredentialResolver {
    /// Builds a resolver over an already-read `VCAP_SERVICES` document.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Credentials` if the document is not valid JSON.
    pub fn new(services: ServicesConfig, vcap_services: Option<&str>) -> Result<Self, IngestError> {
        let vcap = match vcap_services.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(serde_json::from_str(raw).map_err(|e| {
                IngestError::Credentials(format!("{} is not valid JSON: {}", VCAP_SERVICES, e))
            })?),
            None => None,
        };

        Ok(Self { services, vcap })
    }

    /// Builds a resolver reading `VCAP_SERVICES` from the environment.
    pub fn from_env(services: ServicesConfig) -> Result<Self, IngestError> {
        let raw = std::env::var(VCAP_SERVICES).ok();
        Self::new(services, raw.as_deref())
    }

    /// Resolves one service.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Credentials` if neither the config nor
    /// `VCAP_SERVICES` provides usable credentials.
    pub fn resolve(&self, kind: ServiceKind) -> Result<ResolvedCredentials, IngestError> {
        let (explicit, binding) = match kind {
            ServiceKind::Metadata => (&self.services.metadata, &self.services.binding_names.metadata),
            ServiceKind::RawData => (&self.services.raw_data, &self.services.binding_names.raw_data),
            ServiceKind::Location => (&self.services.location, &self.services.binding_names.location),
        };

        if let Some(creds) = explicit {
            tracing::debug!(service = %kind, "Using credentials from configuration");
            return ResolvedCredentials::new(kind, creds);
        }

        let creds = self.lookup_binding(binding).ok_or_else(|| {
            IngestError::Credentials(format!(
                "no credentials for {} service: not configured and no binding named '{}' in {}",
                kind, binding, VCAP_SERVICES
            ))
        })??;

        tracing::debug!(service = %kind, binding = %binding, "Using credentials from service binding");
        ResolvedCredentials::new(kind, &creds)
    }

    /// Resolves all three services.
    pub fn resolve_all(&self) -> Result<ServiceEndpoints, IngestError> {
        Ok(ServiceEndpoints {
            metadata: self.resolve(ServiceKind::Metadata)?,
            raw_data: self.resolve(ServiceKind::RawData)?,
            location: self.resolve(ServiceKind::Location)?,
        })
    }

    /// Finds the instance named `binding` in any service class.
    fn lookup_binding(&self, binding: &str) -> Option<Result<ServiceCredentials, IngestError>> {
        let classes = self.vcap.as_ref()?.as_object()?;

        let instance = classes
            .values()
            .filter_map(JsonValue::as_array)
            .flatten()
            .find(|instance| instance.get("name").and_then(JsonValue::as_str) == Some(binding))?;

        let credentials = instance.get("credentials").cloned().unwrap_or(JsonValue::Null);
        Some(serde_json::from_value(credentials).map_err(|e| {
            IngestError::Credentials(format!("binding '{}' has unusable credentials: {}", binding, e))
        }))
    }
}
