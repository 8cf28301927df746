pub mod client;

pub use client::{ChainRpc, RateLimitConfig, RpcClient, RpcError};
