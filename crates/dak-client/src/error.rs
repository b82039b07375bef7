//! Errors returned by repository API calls
//!
//! Every variant carries enough information for callers to decide how to
//! surface it: plain text for the UI, the HTTP status for branching, and
//! whether an organization SSO authorization is what blocked the call.

use thiserror::Error;

/// Error from a repository API call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// 401, the token is missing, expired or revoked
    #[error("Authentication required: {0}")]
    Unauthorized(String),

    /// 403 caused by organization SAML/SSO enforcement
    #[error("SSO authorization required for {}: {message}", .organization.as_deref().unwrap_or("organization"))]
    SsoRequired {
        organization: Option<String>,
        message: String,
    },

    /// 403 without an SSO marker
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// 404
    #[error("Not found: {0}")]
    NotFound(String),

    /// 409
    #[error("Conflict: {0}")]
    Conflict(String),

    /// 422
    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    /// Any other HTTP status
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// The request never produced an HTTP response
    #[error("Network error: {0}")]
    Transport(String),
}

/// Markers GitHub puts in the message of SSO-blocked responses
const SSO_MARKERS: [&str; 3] = ["saml", "sso", "single sign-on"];

impl ApiError {
    /// Classify an HTTP status and response message
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => ApiError::Unauthorized(message),
            403 if is_sso_message(&message) => ApiError::SsoRequired {
                organization: None,
                message,
            },
            403 => ApiError::Forbidden(message),
            404 => ApiError::NotFound(message),
            409 => ApiError::Conflict(message),
            422 => ApiError::Unprocessable(message),
            _ => ApiError::Status { status, message },
        }
    }

    /// Attach the organization to an SSO error, other variants pass through
    pub fn for_organization(self, org: &str) -> Self {
        match self {
            ApiError::SsoRequired { message, .. } => ApiError::SsoRequired {
                organization: Some(org.to_string()),
                message,
            },
            other => other,
        }
    }

    /// HTTP status of the failed call, None for transport failures
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized(_) => Some(401),
            ApiError::SsoRequired { .. } | ApiError::Forbidden(_) => Some(403),
            ApiError::NotFound(_) => Some(404),
            ApiError::Conflict(_) => Some(409),
            ApiError::Unprocessable(_) => Some(422),
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Transport(_) => None,
        }
    }

    pub fn is_sso_required(&self) -> bool {
        matches!(self, ApiError::SsoRequired { .. })
    }

    /// Network failures and server-side errors, worth retrying on the next tick
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Permission checks treat these as a plain "no"
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ApiError::Forbidden(_) | ApiError::NotFound(_))
    }

    /// Message suitable for an inline status banner
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Unauthorized(_) => {
                "Your session has expired. Please sign in again.".to_string()
            }
            ApiError::SsoRequired { organization, .. } => match organization {
                Some(org) => format!(
                    "Your token must be authorized for the {} organization (SAML SSO).",
                    org
                ),
                None => "Your token must be authorized for this organization (SAML SSO)."
                    .to_string(),
            },
            ApiError::Forbidden(_) => {
                "You do not have permission to perform this action.".to_string()
            }
            ApiError::NotFound(_) => {
                "The resource was not found or you do not have access to it.".to_string()
            }
            ApiError::Conflict(msg) => format!("Conflict: {}", msg),
            ApiError::Unprocessable(msg) => format!("Request rejected: {}", msg),
            ApiError::Status { status, message } if *status >= 500 => format!(
                "The server failed to handle the request ({}): {}",
                status, message
            ),
            ApiError::Status { message, .. } => message.clone(),
            ApiError::Transport(_) => {
                "Network error. Check your connection and try again.".to_string()
            }
        }
    }
}

fn is_sso_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    SSO_MARKERS.iter().any(|marker| lower.contains(marker))
}

impl From<octocrab::Error> for ApiError {
    fn from(err: octocrab::Error) -> Self {
        match &err {
            octocrab::Error::GitHub { source, .. } => {
                ApiError::from_status(source.status_code.as_u16(), source.message.clone())
            }
            _ => ApiError::Transport(err.to_string()),
        }
    }
}
