//! Event source backed by a live contract over Ethereum JSON-RPC.
//!
//! Topics map to `eth_getLogs` filtered by the event signature hash, replayed
//! from block 0. Contract functions map to `eth_call` against the latest
//! block. Transport failures are [`SourceError::Connectivity`]; anything the
//! node returns that cannot be decoded is [`SourceError::Decode`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::{sol, SolCall, SolEvent};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::source::{
    tuple_field, ChainEventSource, RawEvent, Topic, FN_GET_PRODUCT, FN_GET_STAGE, FN_STAGE_COUNT,
};

mod abi {
    use super::sol;

    sol! {
        interface ProvenanceContract {
            event ProducerAdded(string id, string name, string region);
            event ProductRegistered(string id, string name, string producerId);
            event StageAdded(string productId);

            function getProduct(string id)
                external view returns (string, string, string, string, uint256, bool);
            function stageCount(string productId) external view returns (uint256);
            function getStage(string productId, uint256 position)
                external view returns (uint256, string, string, string);
        }
    }

    pub use self::ProvenanceContract::{
        getProductCall, getStageCall, stageCountCall, ProducerAdded, ProductRegistered,
        StageAdded,
    };
}

/// A log entry as returned by `eth_getLogs`.
#[derive(Debug, Deserialize)]
struct RpcLog {
    topics: Vec<B256>,
    data: Bytes,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

fn topic_hash(topic: Topic) -> B256 {
    match topic {
        Topic::ProducerAdded => abi::ProducerAdded::SIGNATURE_HASH,
        Topic::ProductRegistered => abi::ProductRegistered::SIGNATURE_HASH,
        Topic::StageAdded => abi::StageAdded::SIGNATURE_HASH,
    }
}

/// Event fields in the shape the indexer decodes.
fn log_fields(topic: Topic, log: &RpcLog) -> Result<Value, alloy_sol_types::Error> {
    let topics = log.topics.iter().copied();
    let data = log.data.as_ref();
    Ok(match topic {
        Topic::ProducerAdded => {
            let e = abi::ProducerAdded::decode_raw_log(topics, data, true)?;
            json!({"id": e.id, "name": e.name, "region": e.region})
        }
        Topic::ProductRegistered => {
            let e = abi::ProductRegistered::decode_raw_log(topics, data, true)?;
            json!({"id": e.id, "name": e.name, "producerId": e.producerId})
        }
        Topic::StageAdded => {
            let e = abi::StageAdded::decode_raw_log(topics, data, true)?;
            json!({"productId": e.productId})
        }
    })
}

fn timestamp(value: U256, function: &str) -> Result<u64, SourceError> {
    u64::try_from(value)
        .map_err(|e| SourceError::Decode(format!("{function}: timestamp out of range: {e}")))
}

/// Coarse transport failure category. The node URL stays out of the message.
fn network_error(error: &reqwest::Error) -> String {
    if error.is_connect() {
        "connection refused or unreachable".to_string()
    } else if error.is_timeout() {
        "connection timed out".to_string()
    } else if error.is_request() {
        "request failed".to_string()
    } else if error.is_body() {
        "response body error".to_string()
    } else {
        "network error".to_string()
    }
}

/// [`ChainEventSource`] reading a deployed provenance contract through a node.
pub struct RpcEventSource {
    client: Client,
    url: String,
    contract: Address,
    next_id: AtomicU64,
}

impl RpcEventSource {
    /// Source for the contract at `contract` (hex address) served by `url`.
    pub fn new(
        url: impl Into<String>,
        contract: &str,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let contract: Address = contract.parse().map_err(|e| {
            SourceError::Decode(format!("invalid contract address {contract:?}: {e}"))
        })?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Connectivity(format!("http client build failed: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            contract,
            next_id: AtomicU64::new(1),
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, SourceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        debug!(method, id, "rpc request");

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                SourceError::Connectivity(format!("{method}: {}", network_error(&e)))
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Connectivity(format!("{method}: HTTP {status}")));
        }

        let reply: RpcResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(format!("{method}: invalid response: {e}")))?;
        if let Some(err) = reply.error {
            return Err(SourceError::Decode(format!(
                "{method}: rpc error {}: {}",
                err.code, err.message
            )));
        }
        let result = reply
            .result
            .ok_or_else(|| SourceError::Decode(format!("{method}: empty result")))?;
        serde_json::from_value(result)
            .map_err(|e| SourceError::Decode(format!("{method}: unexpected result: {e}")))
    }

    async fn eth_call(&self, calldata: Vec<u8>) -> Result<Bytes, SourceError> {
        let tx = json!({"to": self.contract, "data": Bytes::from(calldata)});
        self.request("eth_call", json!([tx, "latest"])).await
    }
}

#[async_trait]
impl ChainEventSource for RpcEventSource {
    async fn events(&self, topic: Topic, from_position: u64) -> Result<Vec<RawEvent>, SourceError> {
        let filter = json!({
            "address": self.contract,
            "fromBlock": "0x0",
            "toBlock": "latest",
            "topics": [topic_hash(topic)],
        });
        let logs: Vec<RpcLog> = self.request("eth_getLogs", json!([filter])).await?;

        Ok(logs
            .iter()
            .zip(0u64..)
            .skip_while(|(_, position)| *position < from_position)
            .map(|(log, position)| {
                // an undecodable log becomes an empty event so the indexer
                // skips just this position
                let fields = log_fields(topic, log).unwrap_or_else(|e| {
                    warn!(%topic, position, error = %e, "undecodable log");
                    Value::Null
                });
                RawEvent { position, fields }
            })
            .collect())
    }

    async fn call(&self, function: &str, args: &[Value]) -> Result<Vec<Value>, SourceError> {
        let abi_err = |e: alloy_sol_types::Error| SourceError::Decode(format!("{function}: {e}"));
        match function {
            FN_GET_PRODUCT => {
                let id: String = tuple_field(args, 0, function)?;
                let raw = self.eth_call(abi::getProductCall { id }.abi_encode()).await?;
                let r = abi::getProductCall::abi_decode_returns(&raw, true).map_err(abi_err)?;
                Ok(vec![
                    json!(r._0),
                    json!(r._1),
                    json!(r._2),
                    json!(r._3),
                    json!(timestamp(r._4, function)?),
                    json!(r._5),
                ])
            }
            FN_STAGE_COUNT => {
                let product_id: String = tuple_field(args, 0, function)?;
                let raw = self
                    .eth_call(abi::stageCountCall { productId: product_id }.abi_encode())
                    .await?;
                let r = abi::stageCountCall::abi_decode_returns(&raw, true).map_err(abi_err)?;
                let count = u64::try_from(r._0)
                    .map_err(|e| SourceError::Decode(format!("{function}: {e}")))?;
                Ok(vec![json!(count)])
            }
            FN_GET_STAGE => {
                let product_id: String = tuple_field(args, 0, function)?;
                let position: u64 = tuple_field(args, 1, function)?;
                let call = abi::getStageCall {
                    productId: product_id,
                    position: U256::from(position),
                };
                let raw = self.eth_call(call.abi_encode()).await?;
                let r = abi::getStageCall::abi_decode_returns(&raw, true).map_err(abi_err)?;
                Ok(vec![
                    json!(timestamp(r._0, function)?),
                    json!(r._1),
                    json!(r._2),
                    json!(r._3),
                ])
            }
            other => Err(SourceError::Decode(format!("unknown function {other}"))),
        }
    }
}
