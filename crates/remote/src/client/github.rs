//! GitHub REST client for listing and deleting repository caches

use crate::client::contracts::{GithubCache, GithubCacheList};
use crate::client::http::{self, ServiceHeaders};
use crate::config::{GithubApiConfig, RetryConfig};
use crate::error::Result;
use crate::retry::retry_with_backoff;
use reqwest::Client;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// `Accept` header of the GitHub REST API
pub const GITHUB_ACCEPT: &str = "application/vnd.github+json";

/// GitHub REST API version header value
pub const GITHUB_API_VERSION: &str = "2022-11-28";

/// Entries requested per page
pub const PER_PAGE: usize = 100;

/// Last page fetched when listing
pub const MAX_PAGES: usize = 500;

/// Client for `repos/<owner>/<repo>/actions/caches`
#[derive(Debug, Clone)]
pub struct GithubCachesClient {
    http: Client,
    headers: ServiceHeaders,
    config: GithubApiConfig,
    retry: RetryConfig,
}

impl GithubCachesClient {
    /// Create a client for the configured repository and ref
    pub fn new(config: GithubApiConfig, retry: RetryConfig) -> Result<Self> {
        let http = http::build_client(&config.user_agent)?;
        let mut extra = BTreeMap::new();
        extra.insert(
            "X-GitHub-Api-Version".to_string(),
            GITHUB_API_VERSION.to_string(),
        );
        let headers = ServiceHeaders::new(&config.token, GITHUB_ACCEPT, &extra);
        Ok(Self {
            http,
            headers,
            config,
            retry,
        })
    }

    /// Repository and ref configuration
    pub fn config(&self) -> &GithubApiConfig {
        &self.config
    }

    /// List caches of the current ref whose key starts with `key_prefix`.
    ///
    /// Pages are fetched in order until an empty page or [`MAX_PAGES`].
    #[instrument(skip(self))]
    pub async fn list_by_prefix(&self, key_prefix: &str) -> Result<Vec<GithubCache>> {
        let url = self.config.caches_url();
        let per_page = PER_PAGE.to_string();
        let mut caches = Vec::new();

        for page in 1..=MAX_PAGES {
            let page = page.to_string();
            let response = retry_with_backoff(&self.retry, "listCaches", || async {
                let request = self.headers.apply(self.http.get(&url)).query(&[
                    ("key", key_prefix),
                    ("ref", self.config.git_ref.as_str()),
                    ("per_page", per_page.as_str()),
                    ("page", page.as_str()),
                ]);
                let response = http::send("listCaches", request).await?;
                http::ensure_success("listCaches", response).await
            })
            .await?;

            let list: GithubCacheList = http::read_json("listCaches", response).await?;
            if list.actions_caches.is_empty() {
                break;
            }
            caches.extend(list.actions_caches);
        }

        debug!(found = caches.len(), "Listed caches");
        Ok(caches)
    }

    /// Delete every version of `key` in the current ref
    #[instrument(skip(self))]
    pub async fn delete_by_key(&self, key: &str) -> Result<()> {
        let url = self.config.caches_url();
        let request = self
            .headers
            .apply(self.http.delete(&url))
            .query(&[("key", key), ("ref", self.config.git_ref.as_str())]);
        let response = http::send("deleteCache", request).await?;
        http::ensure_success("deleteCache", response).await?;
        Ok(())
    }
}
