//! Solana RPC access.
//!
//! `ChainRpc` is the read-only surface the monitoring pipeline needs.
//! `SolanaRpcClient` implements it over `solana_client`'s nonblocking
//! `RpcClient` and always talks to the endpoint currently selected in the
//! shared [`RpcEndpointPool`].

use crate::{ObservedTransaction, RpcEndpointPool, RpcError};
use async_trait::async_trait;
use kolwatch_core::RetryPolicy;
use serde_json::json;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_client::rpc_request::RpcRequest;
use solana_client::rpc_response::RpcVersionInfo;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_transaction_status::{EncodedConfirmedTransactionWithStatusMeta, UiTransactionEncoding};
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Read-only chain access used by the pipeline.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Raw data of an account, or `None` if the account does not exist.
    async fn get_account_info(&self, key: &str) -> Result<Option<Vec<u8>>, RpcError>;

    /// A confirmed transaction, or `None` if the node does not know it (yet).
    async fn get_transaction(
        &self,
        signature: &str,
    ) -> Result<Option<ObservedTransaction>, RpcError>;

    /// Node version. Used as the liveness check.
    async fn get_version(&self) -> Result<RpcVersionInfo, RpcError>;
}

/// Configuration for [`SolanaRpcClient`].
#[derive(Debug, Clone)]
pub struct SolanaRpcConfig {
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Commitment level for reads
    pub commitment: CommitmentConfig,
    /// Retry policy for transient transport errors
    pub retry: RetryPolicy,
}

impl Default for SolanaRpcConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            commitment: CommitmentConfig::confirmed(),
            retry: RetryPolicy::exponential(3, Duration::from_millis(500), Duration::from_secs(4)),
        }
    }
}

/// `RpcClient` per pool endpoint with bounded retries on transient errors.
pub struct SolanaRpcClient {
    clients: Vec<RpcClient>,
    pool: Arc<RpcEndpointPool>,
    config: SolanaRpcConfig,
}

impl SolanaRpcClient {
    pub fn new(pool: Arc<RpcEndpointPool>, config: SolanaRpcConfig) -> Self {
        let clients = pool
            .endpoints()
            .iter()
            .map(|endpoint| {
                RpcClient::new_with_timeout_and_commitment(
                    endpoint.http_url.clone(),
                    config.request_timeout,
                    config.commitment,
                )
            })
            .collect();
        Self {
            clients,
            pool,
            config,
        }
    }

    /// Client for the endpoint the pool currently prefers.
    fn current(&self) -> Result<&RpcClient, RpcError> {
        self.clients
            .get(self.pool.current_index())
            .ok_or(RpcError::NoEndpoint)
    }

    /// Run `op` against the current endpoint, retrying transient errors.
    async fn with_retry<'a, T, F, Fut>(&'a self, method: &'static str, op: F) -> Result<T, RpcError>
    where
        F: Fn(&'a RpcClient) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let outcome = self
            .config
            .retry
            .run(
                |attempt| {
                    let client = self.current();
                    let call = client.map(&op);
                    async move {
                        let result = match call {
                            Ok(call) => call.await,
                            Err(e) => Err(e),
                        };
                        if let Err(ref e) = result {
                            debug!(method, attempt, error = %e, "RPC call failed");
                        }
                        result
                    }
                },
                RpcError::is_transient,
            )
            .await;
        if outcome.attempts > 1 {
            if let Err(ref e) = outcome.result {
                warn!(method, attempts = outcome.attempts, error = %e, "RPC call gave up");
            }
        }
        outcome.result
    }
}

#[async_trait]
impl ChainRpc for SolanaRpcClient {
    async fn get_account_info(&self, key: &str) -> Result<Option<Vec<u8>>, RpcError> {
        let pubkey = Pubkey::from_str(key).map_err(|e| RpcError::ParseError(e.to_string()))?;
        let commitment = self.config.commitment;
        self.with_retry("getAccountInfo", |client| async move {
            let response = client
                .get_account_with_commitment(&pubkey, commitment)
                .await?;
            Ok(response.value.map(|account| account.data))
        })
        .await
    }

    async fn get_transaction(
        &self,
        signature: &str,
    ) -> Result<Option<ObservedTransaction>, RpcError> {
        Signature::from_str(signature).map_err(|e| RpcError::ParseError(e.to_string()))?;
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Json),
            commitment: Some(self.config.commitment),
            max_supported_transaction_version: Some(0),
        };
        let params = json!([signature, config]);

        // `getTransaction` answers null until the transaction is visible
        let encoded = self
            .with_retry("getTransaction", |client| {
                let params = params.clone();
                async move {
                    let result: Option<EncodedConfirmedTransactionWithStatusMeta> =
                        client.send(RpcRequest::GetTransaction, params).await?;
                    Ok(result)
                }
            })
            .await?;

        encoded
            .map(|encoded| ObservedTransaction::from_encoded(signature, encoded))
            .transpose()
    }

    async fn get_version(&self) -> Result<RpcVersionInfo, RpcError> {
        self.with_retry("getVersion", |client| async move { Ok(client.get_version().await?) })
            .await
    }
}

/// In-memory `ChainRpc` for tests and dry runs.
#[derive(Debug, Default)]
pub struct MockChainRpc {
    accounts: HashMap<String, Vec<u8>>,
    transactions: HashMap<String, ObservedTransaction>,
    failing_accounts: Vec<String>,
    /// Fail every liveness check when set
    pub version_fails: Arc<AtomicBool>,
    /// Hold every liveness check until cleared
    pub version_hangs: Arc<AtomicBool>,
    account_calls: AtomicU32,
    version_calls: AtomicU32,
    fetched: Mutex<Vec<String>>,
}

impl MockChainRpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `data` for `key`.
    pub fn with_account(mut self, key: &str, data: Vec<u8>) -> Self {
        self.accounts.insert(key.to_string(), data);
        self
    }

    /// Return a transport error for `key`.
    pub fn with_failing_account(mut self, key: &str) -> Self {
        self.failing_accounts.push(key.to_string());
        self
    }

    pub fn with_transaction(mut self, tx: ObservedTransaction) -> Self {
        self.transactions.insert(tx.signature.clone(), tx);
        self
    }

    pub fn account_calls(&self) -> u32 {
        self.account_calls.load(Ordering::SeqCst)
    }

    pub fn version_calls(&self) -> u32 {
        self.version_calls.load(Ordering::SeqCst)
    }

    /// Signatures fetched so far, in order.
    pub fn fetched_signatures(&self) -> Vec<String> {
        self.fetched.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChainRpc for MockChainRpc {
    async fn get_account_info(&self, key: &str) -> Result<Option<Vec<u8>>, RpcError> {
        self.account_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_accounts.iter().any(|k| k == key) {
            return Err(RpcError::ConnectionFailed("mock failure".to_string()));
        }
        Ok(self.accounts.get(key).cloned())
    }

    async fn get_transaction(
        &self,
        signature: &str,
    ) -> Result<Option<ObservedTransaction>, RpcError> {
        if let Ok(mut fetched) = self.fetched.lock() {
            fetched.push(signature.to_string());
        }
        Ok(self.transactions.get(signature).cloned())
    }

    async fn get_version(&self) -> Result<RpcVersionInfo, RpcError> {
        self.version_calls.fetch_add(1, Ordering::SeqCst);
        while self.version_hangs.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if self.version_fails.load(Ordering::SeqCst) {
            return Err(RpcError::Timeout("mock version".to_string()));
        }
        Ok(RpcVersionInfo {
            solana_core: "2.3.5".to_string(),
            feature_set: Some(3_294_202_862),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RpcEndpoint;
    use pretty_assertions::assert_eq;

    fn pool(urls: &[&str]) -> Arc<RpcEndpointPool> {
        Arc::new(
            RpcEndpointPool::new(urls.iter().map(|u| RpcEndpoint::from_http(u)).collect())
                .unwrap(),
        )
    }

    #[test]
    fn test_client_follows_pool() {
        let pool = pool(&["https://a.example.com", "https://b.example.com"]);
        let client = SolanaRpcClient::new(pool.clone(), SolanaRpcConfig::default());
        assert_eq!(client.clients.len(), 2);
        assert_eq!(client.current().unwrap().url(), "https://a.example.com");

        pool.rotate();
        assert_eq!(client.current().unwrap().url(), "https://b.example.com");
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected_before_request() {
        let mut config = SolanaRpcConfig::default();
        config.retry = RetryPolicy::immediate(1);
        let client = SolanaRpcClient::new(pool(&["http://127.0.0.1:1"]), config);

        let err = client.get_account_info("not-a-key").await.unwrap_err();
        assert!(matches!(err, RpcError::ParseError(_)));
        let err = client.get_transaction("not-a-signature").await.unwrap_err();
        assert!(matches!(err, RpcError::ParseError(_)));
    }

    #[tokio::test]
    async fn test_mock_accounts() {
        let rpc = MockChainRpc::new()
            .with_account("table", vec![1, 2, 3])
            .with_failing_account("broken");

        assert_eq!(rpc.get_account_info("table").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(rpc.get_account_info("missing").await.unwrap(), None);
        assert!(rpc.get_account_info("broken").await.is_err());
        assert_eq!(rpc.account_calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_version_check() {
        let rpc = MockChainRpc::new();
        assert!(rpc.get_version().await.is_ok());

        rpc.version_fails.store(true, Ordering::SeqCst);
        assert!(rpc.get_version().await.is_err());
        assert_eq!(rpc.version_calls(), 2);
    }
}
