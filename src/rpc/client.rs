use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use alloy::network::Ethereum;
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{Block, BlockNumberOrTag, Filter, Log};
use async_trait::async_trait;
use governor::clock::{QuantaClock, QuantaInstant};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Jitter, Quota, RateLimiter};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Block {0} not found")]
    BlockNotFound(u64),

    #[error("Block number mismatch: requested {requested}, got {got}")]
    BlockNumberMismatch { requested: u64, got: u64 },

    #[error("Missing transaction in block {0}")]
    MissingTransaction(u64),
}

pub type StandardRateLimiter =
    RateLimiter<NotKeyed, InMemoryState, QuantaClock, NoOpMiddleware<QuantaInstant>>;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_second: NonZeroU32,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: NonZeroU32::new(10).unwrap(),
            jitter_min_ms: 5,
            jitter_max_ms: 50,
        }
    }
}

/// The node interface the sprint core consumes. Implemented by [`RpcClient`]
/// for real nodes and by test doubles in unit tests.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError>;

    /// Fetch a block with full transaction bodies.
    async fn block_by_number(&self, number: u64) -> Result<Option<Block>, RpcError>;

    /// Current chain head, used by the scheduler.
    async fn block_number(&self) -> Result<u64, RpcError>;
}

pub struct RpcClient {
    provider: RootProvider<Ethereum>,
    rate_limiter: Option<Arc<StandardRateLimiter>>,
    jitter: Option<Jitter>,
}

impl RpcClient {
    pub fn from_url(url: &str) -> Result<Self, RpcError> {
        let url = Url::parse(url).map_err(|e| RpcError::InvalidUrl(e.to_string()))?;
        Ok(Self {
            provider: RootProvider::<Ethereum>::new_http(url),
            rate_limiter: None,
            jitter: None,
        })
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(config.requests_per_second);
        self.rate_limiter = Some(Arc::new(RateLimiter::direct(quota)));
        self.jitter = Some(Jitter::new(
            Duration::from_millis(config.jitter_min_ms),
            Duration::from_millis(config.jitter_max_ms),
        ));
        self
    }

    async fn wait_for_rate_limit(&self) {
        if let (Some(limiter), Some(jitter)) = (&self.rate_limiter, &self.jitter) {
            limiter.until_ready_with_jitter(*jitter).await;
        }
    }
}

#[async_trait]
impl ChainRpc for RpcClient {
    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError> {
        self.wait_for_rate_limit().await;
        self.provider
            .get_logs(filter)
            .await
            .map_err(|e| RpcError::Provider(e.to_string()))
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<Block>, RpcError> {
        self.wait_for_rate_limit().await;
        self.provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .full()
            .await
            .map_err(|e| RpcError::Provider(e.to_string()))
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        self.wait_for_rate_limit().await;
        self.provider
            .get_block_number()
            .await
            .map_err(|e| RpcError::Provider(e.to_string()))
    }
}
