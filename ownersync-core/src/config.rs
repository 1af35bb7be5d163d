use anyhow::{Context, Result};
use std::env;

use crate::sentry::Provider;

/// Base URL used when `BASE_URL` is not set.
pub const DEFAULT_BASE_URL: &str = "https://sentry.io";

#[derive(Clone)]
pub struct Config {
    pub token: String,
    /// Root of the Sentry API host, without the `/api/0` prefix and without
    /// a trailing slash.
    pub base_url: String,
    pub organization_slug: String,
    pub project_slug: String,
    /// Source-control provider the external identities belong to.
    pub provider: Provider,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let token =
            env::var("SENTRY_TOKEN").context("SENTRY_TOKEN environment variable is required")?;

        let base_url = normalize_base_url(
            &env::var("BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
        );

        let organization_slug = env::var("ORGANIZATION_SLUG")
            .context("ORGANIZATION_SLUG environment variable is required")?;

        let project_slug =
            env::var("PROJECT_SLUG").context("PROJECT_SLUG environment variable is required")?;

        let provider = env::var("PROVIDER")
            .unwrap_or_else(|_| "github".to_string())
            .parse::<Provider>()
            .context("PROVIDER must be one of: github, gitlab")?;

        Ok(Config {
            token,
            base_url,
            organization_slug,
            project_slug,
            provider,
        })
    }
}

/// Strip trailing slashes from a base URL so endpoint paths can always be
/// appended with a leading slash.
pub fn normalize_base_url(raw: &str) -> String {
    raw.trim_end_matches('/').to_string()
}
