//! Tendermint RPC client for Noble and Namada (spec.md §6/§7).
//!
//! Both chains are polled exclusively through the stock Tendermint RPC
//! surface — `tx_search`, `block`, `block_results`, `status` — never a
//! chain-specific gRPC/LCD endpoint, so one client serves both.

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCategory, ErrorSeverity, PollError, RecoveryAction};
use crate::rpc::retry::{RetryPolicy, classify_transport_error, retry_with_backoff};

/// A single event-attribute clause in a `tx_search`/`block_search` query.
///
/// Tendermint's indexer stores some attribute values as raw strings
/// (`transfer.recipient=noble1abc`) and others as JSON-encoded strings
/// (`circle.cctp.v1.MessageReceived.nonce="704111"`, quotes included in the
/// indexed value). `quoted` picks which clause shape to render.
#[derive(Debug, Clone)]
pub struct QueryClause {
    pub key: String,
    pub value: String,
    pub quoted: bool,
}

impl QueryClause {
    /// A clause over a plain string attribute: `key='value'`.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            quoted: false,
        }
    }

    /// A clause over a JSON-string-encoded attribute: `key='"value"'`.
    pub fn quoted(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            quoted: true,
        }
    }
}

/// Builds the logical Tendermint query string from event-attribute clauses,
/// e.g. `[quoted("circle.cctp.v1.MessageReceived.nonce", "704111")]` becomes
/// `circle.cctp.v1.MessageReceived.nonce='"704111"'`. This is the query
/// *grammar*, not the wire encoding sent over HTTP — see
/// [`encode_tx_search_query`] for that.
pub fn build_tx_search_query(clauses: &[QueryClause]) -> Result<String, PollError> {
    if clauses.is_empty() {
        return Err(PollError::new(
            ErrorSeverity::PollingError,
            "tx_search query requires at least one clause",
        ));
    }
    let mut parts = Vec::with_capacity(clauses.len());
    for clause in clauses {
        if clause.value.contains('\'') {
            return Err(PollError::new(
                ErrorSeverity::PollingError,
                format!("query value for '{}' cannot contain a single quote", clause.key),
            ));
        }
        if clause.quoted {
            parts.push(format!("{}='\"{}\"'", clause.key, clause.value));
        } else {
            parts.push(format!("{}='{}'", clause.key, clause.value));
        }
    }
    Ok(parts.join(" AND "))
}

/// Encodes a logical query string (from [`build_tx_search_query`]) the way
/// CometBFT's HTTP GET endpoints expect a string-typed URI parameter: wrapped
/// in an outer pair of double quotes (so the server's URI-param decoder reads
/// it as a JSON string), percent-encoded with `encodeURIComponent`'s
/// unreserved set, with the resulting `%5C` sequences restored to literal
/// backslashes (CometBFT's own query parser expects the escape backslash
/// itself, not its percent-encoded form).
pub fn encode_tx_search_query(logical_query: &str) -> String {
    let escaped = logical_query.replace('"', "\\\"");
    let wrapped = format!("\"{escaped}\"");
    percent_encode_query_component(&wrapped).replace("%5C", "\\")
}

fn percent_encode_query_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        let is_unreserved = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'_' | b'.' | b'!' | b'~' | b'*' | b'\'' | b'(' | b')');
        if is_unreserved {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxSearchResponse {
    pub txs: Vec<TxSearchEntry>,
    pub total_count: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxSearchEntry {
    pub hash: String,
    pub height: String,
    #[serde(default)]
    pub tx_result: TxResult,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TxResult {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub events: Vec<TmEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TmEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<TmEventAttribute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TmEventAttribute {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

impl TxResult {
    /// `true` when the transaction's top-level execution failed (non-zero
    /// ABCI code), the `TxError` signal pollers watch for (spec.md §6).
    pub fn failed(&self) -> bool {
        self.code != 0
    }

    pub fn find_attribute(&self, event_type: &str, attr_key: &str) -> Option<&str> {
        find_attribute(&self.events, event_type, attr_key)
    }
}

/// Looks up the first `attr_key` attribute of the first `event_type` event in
/// a flat event list, shared by `tx_result.events` and `block_results`'
/// `finalize_block_events`/`end_block_events`.
pub fn find_attribute<'a>(events: &'a [TmEvent], event_type: &str, attr_key: &str) -> Option<&'a str> {
    events
        .iter()
        .find(|e| e.kind == event_type)
        .and_then(|e| e.attributes.iter().find(|a| a.key == attr_key))
        .map(|a| a.value.as_str())
}

/// Every event of `event_type` in a flat event list, in order.
pub fn find_events<'a>(events: &'a [TmEvent], event_type: &str) -> impl Iterator<Item = &'a TmEvent> {
    events.iter().filter(move |e| e.kind == event_type)
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockResponse {
    pub block: BlockBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockBody {
    pub header: BlockHeader,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockHeader {
    pub height: String,
    pub time: String,
}

/// `block_results` response (spec.md §9 "Namada/Noble event scanning"):
/// CometBFT renamed `end_block_events` to `finalize_block_events` across
/// versions, so both are deserialized and [`all_events`](Self::all_events)
/// scans the union.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlockResultsResponse {
    pub height: String,
    #[serde(default)]
    pub finalize_block_events: Vec<TmEvent>,
    #[serde(default)]
    pub end_block_events: Vec<TmEvent>,
}

impl BlockResultsResponse {
    /// All block-level events from this height, regardless of which
    /// CometBFT-version field name they arrived under.
    pub fn all_events(&self) -> Vec<TmEvent> {
        self.finalize_block_events
            .iter()
            .cloned()
            .chain(self.end_block_events.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub sync_info: SyncInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncInfo {
    pub latest_block_height: String,
    pub latest_block_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct RpcEnvelope<T> {
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcEnvelopeError>,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelopeError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Value,
}

/// A minimal Tendermint JSON-RPC client, retried per [`RetryPolicy`].
pub struct TendermintClient {
    http: reqwest::Client,
    base_url: url::Url,
    retry_policy: RetryPolicy,
}

impl TendermintClient {
    pub fn new(base_url: url::Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        params: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<T, PollError> {
        retry_with_backoff(&self.retry_policy, cancel, || async {
            let url = self
                .base_url
                .join(path)
                .map_err(|e| PollError::new(ErrorSeverity::PollingError, e.to_string()))?;
            let response = self
                .http
                .get(url)
                .query(params)
                .send()
                .await
                .map_err(|e| classify_transport_error(&e))?;
            self.decode_envelope(response).await
        })
        .await
    }

    /// Like [`Self::get`], but with a pre-encoded raw query string appended
    /// verbatim rather than built by `reqwest`'s own form encoder — needed
    /// for `tx_search`, whose `query` parameter requires the exact wire
    /// encoding in [`encode_tx_search_query`], not generic form encoding.
    async fn get_raw<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        raw_query: &str,
        cancel: &CancellationToken,
    ) -> Result<T, PollError> {
        retry_with_backoff(&self.retry_policy, cancel, || async {
            let joined = self
                .base_url
                .join(path)
                .map_err(|e| PollError::new(ErrorSeverity::PollingError, e.to_string()))?;
            let url_str = format!("{}?{}", joined.as_str().trim_end_matches('?'), raw_query);
            let url = url::Url::parse(&url_str)
                .map_err(|e| PollError::new(ErrorSeverity::PollingError, e.to_string()))?;
            let response = self
                .http
                .get(url)
                .send()
                .await
                .map_err(|e| classify_transport_error(&e))?;
            self.decode_envelope(response).await
        })
        .await
    }

    async fn decode_envelope<T: for<'de> Deserialize<'de>>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, PollError> {
        let envelope: RpcEnvelope<T> = response
            .json()
            .await
            .map_err(|e| classify_transport_error(&e))?;
        if let Some(err) = envelope.error {
            return Err(PollError::new(
                ErrorSeverity::PollingError,
                format!("tendermint rpc error {}: {} ({})", err.code, err.message, err.data),
            )
            .with_category(ErrorCategory::Rpc)
            .with_recovery(true, RecoveryAction::CheckRpcStatus));
        }
        envelope.result.ok_or_else(|| {
            PollError::new(ErrorSeverity::PollingError, "tendermint rpc returned no result")
                .with_category(ErrorCategory::Rpc)
        })
    }

    /// `query` is the logical query string from [`build_tx_search_query`];
    /// this method applies the wire encoding and issues the request. No
    /// paging is requested — callers only ever need the first match, and
    /// CometBFT's own default page size comfortably covers that.
    pub async fn tx_search(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<TxSearchResponse, PollError> {
        let raw_query = format!("query={}", encode_tx_search_query(query));
        self.get_raw("tx_search", &raw_query, cancel).await
    }

    pub async fn block(
        &self,
        height: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<BlockResponse, PollError> {
        let params: Vec<(&str, String)> = match height {
            Some(h) => vec![("height", h.to_string())],
            None => vec![],
        };
        self.get("block", &params, cancel).await
    }

    pub async fn block_results(
        &self,
        height: u64,
        cancel: &CancellationToken,
    ) -> Result<BlockResultsResponse, PollError> {
        self.get("block_results", &[("height", height.to_string())], cancel).await
    }

    pub async fn status(&self, cancel: &CancellationToken) -> Result<StatusResponse, PollError> {
        self.get("status", &[], cancel).await
    }
}
