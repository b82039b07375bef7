//! Authentication state and token resolution
//!
//! Token storage and expiry are not managed here; the resolver only finds a
//! token the user already has, and `SessionAuth` records who the client is
//! signed in as.

use crate::types::Identity;
use anyhow::{Context, Result};
use dak_config::DEFAULT_HOST;
use log::debug;
use std::sync::{PoisonError, RwLock};

/// Authentication state consulted before any remote call is made
pub trait AuthProvider: Send + Sync {
    fn is_authenticated(&self) -> bool;

    /// The signed-in account, None when unauthenticated
    fn identity(&self) -> Option<Identity>;
}

/// In-memory authentication state
#[derive(Debug, Default)]
pub struct SessionAuth {
    identity: RwLock<Option<Identity>>,
}

impl SessionAuth {
    /// Unauthenticated session
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Session signed in as `identity`
    pub fn signed_in(identity: Identity) -> Self {
        Self {
            identity: RwLock::new(Some(identity)),
        }
    }

    pub fn sign_in(&self, identity: Identity) {
        *self.identity.write().unwrap_or_else(PoisonError::into_inner) = Some(identity);
    }

    pub fn sign_out(&self) {
        *self.identity.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl AuthProvider for SessionAuth {
    fn is_authenticated(&self) -> bool {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn identity(&self) -> Option<Identity> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Where a resolved token came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    HostVariable,
    GhCli,
    SharedVariable,
}

/// Finds the token for one API host
///
/// The host variable wins over the gh CLI login; `GITHUB_TOKEN` and
/// `GH_TOKEN` only count for github.com so a public token is never sent to
/// an enterprise server.
#[derive(Debug, Clone)]
pub struct TokenResolver {
    host: String,
}

impl TokenResolver {
    pub fn for_host(host: Option<&str>) -> Self {
        Self {
            host: host.unwrap_or(DEFAULT_HOST).to_string(),
        }
    }

    /// `GITHUB_TOKEN_<HOST>` with dots and dashes as underscores
    pub fn host_variable(&self) -> String {
        let suffix: String = self
            .host
            .chars()
            .map(|c| match c {
                '.' | '-' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!("GITHUB_TOKEN_{}", suffix)
    }

    fn shared_variable(&self) -> Option<String> {
        if self.host != DEFAULT_HOST {
            return None;
        }
        ["GITHUB_TOKEN", "GH_TOKEN"]
            .into_iter()
            .find_map(|name| std::env::var(name).ok().and_then(non_empty))
    }

    async fn gh_cli_token(&self) -> Result<Option<String>> {
        let output = match tokio::process::Command::new("gh")
            .args(["auth", "token", "--hostname", &self.host])
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                debug!("gh CLI not usable: {}", e);
                return Ok(None);
            }
        };
        if !output.status.success() {
            return Ok(None);
        }
        let stdout = String::from_utf8(output.stdout).context("gh printed a non UTF-8 token")?;
        Ok(non_empty(stdout))
    }

    pub async fn resolve(&self) -> Result<(String, TokenSource)> {
        let variable = self.host_variable();
        if let Some(token) = std::env::var(&variable).ok().and_then(non_empty) {
            return Ok((token, TokenSource::HostVariable));
        }
        if let Some(token) = self.gh_cli_token().await? {
            return Ok((token, TokenSource::GhCli));
        }
        if let Some(token) = self.shared_variable() {
            return Ok((token, TokenSource::SharedVariable));
        }
        anyhow::bail!(
            "No token for {}: set {} or run 'gh auth login --hostname {}'",
            self.host,
            variable,
            self.host
        )
    }
}

fn non_empty(token: String) -> Option<String> {
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}
