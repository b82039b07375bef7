//! Explicit API context
//!
//! Bundles the repository client and the authentication state so both can
//! be handed to every component at construction time instead of being
//! looked up from a shared global.

use crate::auth::{AuthProvider, SessionAuth, TokenResolver};
use crate::client::RepositoryClient;
use crate::octocrab_client::OctocrabClient;
use anyhow::{Context, Result};
use dak_config::DEFAULT_HOST;
use log::{debug, info, warn};
use octocrab::Octocrab;
use std::sync::Arc;

/// Client and authentication state shared by the coordination components
#[derive(Clone)]
pub struct ApiContext {
    pub client: Arc<dyn RepositoryClient>,
    pub auth: Arc<dyn AuthProvider>,
}

impl ApiContext {
    pub fn new(client: Arc<dyn RepositoryClient>, auth: Arc<dyn AuthProvider>) -> Self {
        Self { client, auth }
    }

    /// Build a context for the given host (None = github.com)
    ///
    /// Resolves a token, builds an octocrab client with the matching base
    /// URL and signs in as the account the token belongs to. A token that
    /// the API rejects leaves the context unauthenticated.
    pub async fn connect(host: Option<&str>) -> Result<Self> {
        let effective_host = host.unwrap_or(DEFAULT_HOST);
        info!("Creating API client for host: {}", effective_host);

        let (token, source) = TokenResolver::for_host(host).resolve().await?;
        debug!("Using {:?} token for {}", source, effective_host);

        let mut builder = Octocrab::builder().personal_token(token);
        let base_url = if effective_host != DEFAULT_HOST {
            let uri = format!("https://{}/api/v3", effective_host);
            builder = builder.base_uri(&uri).context("Failed to set base URI")?;
            uri
        } else {
            "https://api.github.com".to_string()
        };

        let octocrab = builder.build().context("Failed to build Octocrab client")?;
        let client = OctocrabClient::with_base_url(Arc::new(octocrab), base_url);

        let auth = match client.fetch_authenticated_user().await {
            Ok(identity) => {
                info!("Authenticated as {} on {}", identity.login, effective_host);
                SessionAuth::signed_in(identity)
            }
            Err(e) => {
                warn!(
                    "Token for {} was not accepted, continuing unauthenticated: {}",
                    effective_host, e
                );
                SessionAuth::anonymous()
            }
        };

        Ok(Self::new(Arc::new(client), Arc::new(auth)))
    }
}

impl std::fmt::Debug for ApiContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiContext")
            .field("authenticated", &self.auth.is_authenticated())
            .finish_non_exhaustive()
    }
}
