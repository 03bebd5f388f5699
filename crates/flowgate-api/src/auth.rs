//! API-key authentication

use subtle::ConstantTimeEq;

use crate::config::GatewayConfig;
use crate::error::ApiError;

/// Request header carrying the client's API key
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Shared-secret check for protected routes
#[derive(Clone)]
pub struct ApiKeyAuth {
    key: Option<String>,
    bypass: bool,
}

impl std::fmt::Debug for ApiKeyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyAuth")
            .field("configured", &self.key.is_some())
            .field("bypass", &self.bypass)
            .finish()
    }
}

impl ApiKeyAuth {
    /// Require `key` on every protected request
    pub fn new(key: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            bypass: false,
        }
    }

    /// Accept every request. Development only.
    pub fn bypass() -> Self {
        Self {
            key: None,
            bypass: true,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        if config.auth_bypass_enabled() {
            tracing::warn!("API key authentication is disabled - development use only");
            return Self::bypass();
        }
        Self {
            key: config.auth.api_key.clone(),
            bypass: false,
        }
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    /// Verify the presented key.
    ///
    /// With no key configured and bypass off, everything is rejected.
    pub fn verify(&self, presented: Option<&str>) -> Result<(), ApiError> {
        if self.bypass {
            return Ok(());
        }

        let presented =
            presented.ok_or_else(|| ApiError::Unauthorized("Missing API key".to_string()))?;
        let expected = self
            .key
            .as_deref()
            .ok_or_else(|| ApiError::Unauthorized("Invalid API key".to_string()))?;

        if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized("Invalid API key".to_string()))
        }
    }
}

/// Loggable form of a presented key
pub fn mask_key(presented: Option<&str>) -> &'static str {
    match presented {
        Some(_) => "***",
        None => "none",
    }
}
