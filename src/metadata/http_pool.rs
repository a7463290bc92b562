use std::time::Duration;

use reqwest::header::{HeaderMap, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Client, ClientBuilder, Proxy};
use serde_json::Value;
use url::Url;

use crate::config::NetworkConfig;
use crate::errors::{AppError, Result};

/// Shared HTTP clients for every resolver and the music search backend.
///
/// Two clients share one configuration: `client` follows redirects as
/// usual, `manual` never does so short links can be read hop by hop.
#[derive(Clone)]
pub struct HttpPool {
    client: Client,
    manual: Client,
    redirect_timeout: Duration,
    lookup_timeout: Duration,
}

impl HttpPool {
    pub fn new(network: &NetworkConfig) -> Result<Self> {
        let client = Self::builder(network)?.build()?;
        let manual = Self::builder(network)?.redirect(Policy::none()).build()?;

        Ok(Self {
            client,
            manual,
            redirect_timeout: network.redirect_timeout(),
            lookup_timeout: network.lookup_timeout(),
        })
    }

    fn builder(network: &NetworkConfig) -> Result<ClientBuilder> {
        let mut builder = ClientBuilder::new()
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .connect_timeout(Duration::from_secs(15))
            .user_agent(network.user_agent.as_str())
            .gzip(true)
            .brotli(true)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true);

        if let Some(proxy_url) = network.proxy.as_deref().filter(|p| !p.trim().is_empty()) {
            builder = builder.proxy(Proxy::all(proxy_url)?);
        }

        Ok(builder)
    }

    pub fn get_client(&self) -> &Client {
        &self.client
    }

    pub fn redirect_timeout(&self) -> Duration {
        self.redirect_timeout
    }

    pub fn lookup_timeout(&self) -> Duration {
        self.lookup_timeout
    }

    pub async fn fetch_text(&self, url: &str, timeout: Duration) -> Result<String> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        if !response.status().is_success() {
            return Err(AppError::Download(format!("HTTP {} for {}", response.status(), url)));
        }
        let bytes = response.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn fetch_json(&self, url: &str, timeout: Duration) -> Result<Value> {
        let text = self.fetch_text(url, timeout).await?;
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn post_json(&self, url: &str, headers: HeaderMap, body: &Value, timeout: Duration) -> Result<Value> {
        let response = self
            .client
            .post(url)
            .headers(headers)
            .json(body)
            .timeout(timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AppError::Search(format!("HTTP {} for {}", response.status(), url)));
        }
        Ok(response.json().await?)
    }

    /// Issues one request without following redirects and returns where it
    /// points: the `Location` header resolved against `url`, or `url` itself
    /// when the server answered directly.
    pub async fn resolve_redirect(&self, url: &str) -> Result<String> {
        let response = self
            .manual
            .get(url)
            .timeout(self.redirect_timeout)
            .send()
            .await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        match location {
            Some(location) => {
                let base = Url::parse(url)?;
                Ok(base.join(&location)?.to_string())
            }
            None => Ok(response.url().to_string()),
        }
    }

    /// Follows short links while `is_short` keeps matching, up to `max_hops`
    /// requests. Any failed hop stops at the last URL reached.
    pub async fn follow_short_links<F>(&self, url: &str, max_hops: usize, is_short: F) -> String
    where
        F: Fn(&str) -> bool,
    {
        let mut current = url.to_string();
        for hop in 0..max_hops {
            if !is_short(&current) {
                break;
            }
            match self.resolve_redirect(&current).await {
                Ok(next) if next != current => {
                    log::debug!("🔗 [HTTP] hop {} {} -> {}", hop + 1, current, next);
                    current = next;
                }
                Ok(_) => break,
                Err(e) => {
                    log::debug!("⚠️ [HTTP] redirect lookup failed for {}: {}", current, e);
                    break;
                }
            }
        }
        current
    }
}

/// Lowercase host of `url`, empty when it does not parse.
pub fn host_of(url: &str) -> String {
    Url::parse(url.trim())
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_default()
}
