//! HTTP JSON-RPC node client backed by `reqwest`.
//!
//! Speaks JSON-RPC 2.0 to a node gateway. Transient failures (transport,
//! non-2xx status) are retried with exponential backoff; RPC error objects
//! and malformed results are returned immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use cisindex_core::error::IndexerError;
use cisindex_core::node::{NodeClient, StandardIdentifier};
use cisindex_core::types::{BlockInfo, ContractAddress, Height, Transaction};

use crate::retry::{RetryConfig, RetryPolicy};

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// The result value, or the RPC error as a non-transient [`IndexerError`].
    pub fn into_result(self) -> Result<Value, IndexerError> {
        match self.error {
            Some(err) => Err(IndexerError::Decode(format!(
                "JSON-RPC error {}: {}",
                err.code, err.message
            ))),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Configuration for [`HttpNodeClient`].
#[derive(Debug, Clone)]
pub struct HttpNodeConfig {
    pub retry: RetryConfig,
    pub request_timeout: Duration,
}

impl Default for HttpNodeConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::node_requests(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpNodeClient {
    url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

impl HttpNodeClient {
    pub fn new(url: impl Into<String>, config: HttpNodeConfig) -> Result<Self, IndexerError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| IndexerError::Config(format!("http client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
            retry: RetryPolicy::new(config.retry),
            next_id: AtomicU64::new(1),
        })
    }

    /// Build the next request, numbering ids per client.
    pub fn request(&self, method: &str, params: Vec<Value>) -> JsonRpcRequest {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        JsonRpcRequest::new(id, method, params)
    }

    async fn send_once(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, IndexerError> {
        let resp = self
            .http
            .post(&self.url)
            .json(req)
            .send()
            .await
            .map_err(|e| IndexerError::Node(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(IndexerError::Node(format!("HTTP {status}: {body}")));
        }

        let body = resp.bytes().await.map_err(|e| IndexerError::Node(e.to_string()))?;
        parse_response(&body)
    }

    /// Send with retries and return the raw result value.
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, IndexerError> {
        let req = self.request(method, params);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(&req).await {
                Ok(resp) => return resp.into_result(),
                Err(e) if e.is_transient() => match self.retry.next_delay(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            attempt,
                            method,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            url = %self.url,
                            "retrying node request"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(attempt, method, error = %e, url = %self.url, "max retries exceeded");
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_typed<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T, IndexerError> {
        parse_result(method, self.call(method, params).await?)
    }
}

/// A 2xx body that is not a JSON-RPC response is a decode error, not a
/// transport failure.
fn parse_response(body: &[u8]) -> Result<JsonRpcResponse, IndexerError> {
    serde_json::from_slice(body).map_err(|e| IndexerError::Decode(format!("malformed JSON-RPC response: {e}")))
}

fn parse_result<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, IndexerError> {
    serde_json::from_value(value).map_err(|e| IndexerError::Decode(format!("{method}: {e}")))
}

/// Probe parameters for `probeStandardSupport`.
pub fn probe_params(address: ContractAddress, entrypoint: &str, standards: &[StandardIdentifier]) -> Value {
    json!({
        "index": address.index,
        "subindex": address.subindex,
        "entrypoint": entrypoint,
        "standards": standards.iter().map(StandardIdentifier::as_str).collect::<Vec<_>>(),
    })
}

/// A contract supports the set if it supports any listed standard.
pub fn any_supported(answers: &[bool]) -> bool {
    answers.iter().any(|supported| *supported)
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn get_finalized_height(&self) -> Result<Height, IndexerError> {
        self.call_typed("getFinalizedHeight", vec![]).await
    }

    async fn get_block_info(&self, height: Height) -> Result<BlockInfo, IndexerError> {
        let value = self.call("getBlockInfo", vec![json!(height)]).await?;
        if value.is_null() {
            return Err(IndexerError::BlockNotFound { height });
        }
        parse_result("getBlockInfo", value)
    }

    async fn get_block_transactions(&self, height: Height) -> Result<Vec<Transaction>, IndexerError> {
        self.call_typed("getBlockTransactions", vec![json!(height)]).await
    }

    async fn probe_standard_support(
        &self,
        address: ContractAddress,
        entrypoint: &str,
        standards: &[StandardIdentifier],
    ) -> Result<bool, IndexerError> {
        let answers: Vec<bool> = self
            .call_typed(
                "probeStandardSupport",
                vec![probe_params(address, entrypoint, standards)],
            )
            .await?;
        Ok(any_supported(&answers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_numbered_per_client() {
        let client = HttpNodeClient::new("http://localhost:1", HttpNodeConfig::default()).unwrap();
        let first = client.request("getFinalizedHeight", vec![]);
        let second = client.request("getBlockInfo", vec![json!(5)]);
        assert_eq!((first.id, second.id), (1, 2));

        let json = serde_json::to_string(&second).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"getBlockInfo\""));
        assert!(json.contains("\"params\":[5]"));
    }

    #[test]
    fn probe_params_shape() {
        let params = probe_params(
            ContractAddress::new(9, 1),
            "token.supports",
            &[StandardIdentifier::Cis1, StandardIdentifier::Cis2],
        );
        assert_eq!(params["index"], 9);
        assert_eq!(params["subindex"], 1);
        assert_eq!(params["entrypoint"], "token.supports");
        assert_eq!(params["standards"], json!(["CIS-1", "CIS-2"]));
    }

    #[test]
    fn any_standard_is_enough() {
        assert!(any_supported(&[false, true]));
        assert!(!any_supported(&[false, false]));
        assert!(!any_supported(&[]));
    }

    #[test]
    fn rpc_error_is_not_transient() {
        let resp: JsonRpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "error": { "code": -32601, "message": "method not found" }
        }))
        .unwrap();
        let err = resp.into_result().unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("-32601"));
    }

    #[test]
    fn null_result_parses_as_null() {
        let resp: JsonRpcResponse =
            serde_json::from_value(json!({ "jsonrpc": "2.0", "id": 1, "result": null })).unwrap();
        assert!(resp.into_result().unwrap().is_null());
    }

    #[test]
    fn malformed_body_is_a_decode_error() {
        let err = parse_response(b"<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, IndexerError::Decode(_)));
        assert!(!err.is_transient());

        let resp = parse_response(br#"{"jsonrpc":"2.0","id":1,"result":7}"#).unwrap();
        assert_eq!(resp.into_result().unwrap(), json!(7));
    }

    #[test]
    fn client_retries_are_shorter_than_stage_retries() {
        let client = HttpNodeConfig::default().retry;
        let stage = RetryConfig::default();
        assert!(client.max_retries < stage.max_retries);
        assert!(client.max_backoff_ms < stage.max_backoff_ms);
    }

    #[test]
    fn typed_results_reject_wrong_shape() {
        let err = parse_result::<Height>("getFinalizedHeight", json!("high")).unwrap_err();
        assert!(matches!(err, IndexerError::Decode(_)));
        assert_eq!(parse_result::<Height>("getFinalizedHeight", json!(42)).unwrap(), 42);
    }
}
