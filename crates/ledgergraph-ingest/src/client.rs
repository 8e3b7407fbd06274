//! HTTP client for the node's REST query interface.
//!
//! Every call runs under the shared [`ResiliencePolicy`], so transient
//! transport failures retry with backoff, a sick node opens the circuit,
//! and no single attempt outlives its deadline. Server-side errors (5xx)
//! are treated as transient; client-side errors (4xx) are not, since the
//! same request would fail the same way again.

use crate::error::{Error, Result};
use crate::resilience::ResiliencePolicy;
use ledgergraph_core::{Block, ChainInfo, Transaction};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

/// Client over the node's REST interface.
#[derive(Clone)]
pub struct LedgerClient {
    http: reqwest::Client,
    base_url: String,
    policy: ResiliencePolicy,
}

impl LedgerClient {
    pub fn new(base_url: impl Into<String>, policy: ResiliencePolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            policy,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/rest/{path}", self.base_url)
    }

    /// Summary of the chain the node follows.
    pub async fn chain_info(&self) -> Result<ChainInfo> {
        self.get_json("chaininfo.json").await
    }

    /// Fetch chain info and refuse anything but the expected chain.
    pub async fn assert_chain(&self, expected: &str) -> Result<ChainInfo> {
        let info = self.chain_info().await?;
        if info.chain != expected {
            return Err(Error::WrongChain {
                expected: expected.to_string(),
                actual: info.chain,
            });
        }
        info!(
            chain = %info.chain,
            head = info.blocks,
            "connected to node"
        );
        Ok(info)
    }

    /// The hash of the block at `height`.
    pub async fn block_hash(&self, height: u64) -> Result<String> {
        let hex = self
            .get_text(&format!("blockhashbyheight/{height}.hex"))
            .await?;
        let hex = hex.trim();
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidHash(hex.to_string()));
        }
        Ok(hex.to_string())
    }

    /// The full block (with expanded transactions) for `hash`.
    pub async fn block(&self, hash: &str) -> Result<Block> {
        self.get_json(&format!("block/{hash}.json")).await
    }

    /// A single transaction by id; used when a spent output was not cached.
    pub async fn transaction(&self, txid: &str) -> Result<Transaction> {
        self.get_json(&format!("tx/{txid}.json")).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path);
        self.policy
            .execute(|| {
                let http = self.http.clone();
                let url = url.clone();
                async move {
                    debug!(%url, "GET");
                    let response = http
                        .get(&url)
                        .send()
                        .await
                        .map_err(|e| Error::Transport(e.to_string()))?;
                    let response = check_status(response, &url).await?;
                    response
                        .json::<T>()
                        .await
                        .map_err(|e| Error::Node(format!("bad body from {url}: {e}")))
                }
            })
            .await
    }

    async fn get_text(&self, path: &str) -> Result<String> {
        let url = self.endpoint(path);
        self.policy
            .execute(|| {
                let http = self.http.clone();
                let url = url.clone();
                async move {
                    debug!(%url, "GET");
                    let response = http
                        .get(&url)
                        .send()
                        .await
                        .map_err(|e| Error::Transport(e.to_string()))?;
                    let response = check_status(response, &url).await?;
                    response
                        .text()
                        .await
                        .map_err(|e| Error::Node(format!("bad body from {url}: {e}")))
                }
            })
            .await
    }
}

async fn check_status(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let body = body.trim();
    if status.is_server_error() {
        Err(Error::Transport(format!("{url} returned {status}: {body}")))
    } else {
        Err(Error::Node(format!("{url} returned {status}: {body}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResilienceOptions;
    use tokio_util::sync::CancellationToken;

    fn client(base: &str) -> LedgerClient {
        let policy = ResiliencePolicy::new(ResilienceOptions::default(), CancellationToken::new());
        LedgerClient::new(base, policy).unwrap()
    }

    #[test]
    fn test_endpoint_paths() {
        let c = client("http://127.0.0.1:8332");
        assert_eq!(
            c.endpoint("chaininfo.json"),
            "http://127.0.0.1:8332/rest/chaininfo.json"
        );
        assert_eq!(
            c.endpoint("blockhashbyheight/42.hex"),
            "http://127.0.0.1:8332/rest/blockhashbyheight/42.hex"
        );
    }

    #[test]
    fn test_trailing_slash_is_normalized() {
        let c = client("http://node:8332/");
        assert_eq!(
            c.endpoint("block/abc.json"),
            "http://node:8332/rest/block/abc.json"
        );
    }
}
