pub mod client;

pub use client::{
    retry_rpc, ChainClient, RetryPolicy, RpcChainClient, RpcClientConfig, RpcError,
};
