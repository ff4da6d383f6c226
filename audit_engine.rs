//! # Audit Engine - Control Plane of the Audit Service
//!
//! Keeps a consistent, periodically refreshed view of the state the audit
//! query service depends on, and serves statistics queries on top of it.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            AUDIT CONTROL PLANE                              │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  SQL STORE  → CONFIG SYNC ENGINE → metric ids / data-source directory       │
//! │  MANAGER    → DISCOVERY CLIENT   → collector addresses → random selection   │
//! │  HTTP       → QUERY GATEWAY      → rate limit → validate → tier routing     │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Snapshot Publishing**: every refreshable data set is rebuilt off the hot
//!   path and published by a single reference swap
//! - **Stale-on-Failure**: a failed or empty refresh never replaces good data
//! - **Client-Side Load Balancing**: uniform random selection over discovered collectors
//! - **Backpressure**: per-endpoint token buckets delay callers instead of rejecting them

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// All external crate imports, grouped by concern.
// ============================================================================

#![allow(dead_code)]
#![allow(unused_imports)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::future::Future;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::net::{TcpListener as TokioTcpListener, TcpSocket};
use tokio::runtime::Builder as RuntimeBuilder;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle as TokioJoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use futures::FutureExt;
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use parking_lot::{Mutex, RwLock};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use once_cell::sync::OnceCell;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, prelude::*, EnvFilter};

// ----------------------------------------------------------------------------
// Time
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// HTTP Client & Server
// ----------------------------------------------------------------------------
use reqwest::Client as HttpClient;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

// ----------------------------------------------------------------------------
// Rate Limiting & Selection
// ----------------------------------------------------------------------------
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rand::seq::SliceRandom;

// ----------------------------------------------------------------------------
// Backing Store
// ----------------------------------------------------------------------------
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::{MySqlPool, Row};

// ----------------------------------------------------------------------------
// Configuration, CLI & Metrics
// ----------------------------------------------------------------------------
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use clap::{Parser, Subcommand};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry as PrometheusRegistry, TextEncoder};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Defaults for every externally configurable knob plus the fixed protocol
// strings shared by the gateway and the discovery client.
// ============================================================================

/// Service version - follows semantic versioning
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SERVICE_NAME: &str = "audit-service";
pub const SERVICE_FULL_NAME: &str = "Audit Control Plane";

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "audit-service.toml";

/// Prefix for environment overrides, e.g. `AUDIT_API__BIND_PORT`
pub const ENV_PREFIX: &str = "AUDIT_";

// ----------------------------------------------------------------------------
// Backing Store & Config Sync
// ----------------------------------------------------------------------------

/// Default interval between config refresh cycles (seconds)
pub const DEFAULT_CONFIG_UPDATE_INTERVAL_SECS: u64 = 60;

pub const DEFAULT_STORE_URL: &str = "jdbc:mysql://127.0.0.1:3306/apache_inlong_audit";
pub const DEFAULT_STORE_USERNAME: &str = "root";

/// Connections kept by the config store pool
pub const DEFAULT_STORE_POOL_SIZE: u32 = 2;

/// Time allowed to acquire a pooled connection (milliseconds)
pub const DEFAULT_STORE_CONNECTION_TIMEOUT_MS: u64 = 30_000;

/// Prepared statement cache capacity per connection
pub const DEFAULT_PREP_STMT_CACHE_SIZE: usize = 250;

pub const DEFAULT_METRIC_IDS_SQL: &str = "SELECT audit_id FROM audit_id_config WHERE status = 1";
pub const DEFAULT_DATA_SOURCES_SQL: &str =
    "SELECT driver_class, jdbc_url, user_name, password, service_id FROM audit_source_config WHERE status = 1";

/// Accepted in front of store URLs for compatibility with JDBC-style settings
pub const JDBC_URL_PREFIX: &str = "jdbc:";

// ----------------------------------------------------------------------------
// Discovery
// ----------------------------------------------------------------------------

/// Fixed manager path serving the collector address list
pub const DISCOVERY_API_PATH: &str = "/inlong/manager/openapi/audit/getAuditProxy";

/// Timeout for a single discovery pull (milliseconds)
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 10_000;

/// Interval between discovery pulls (milliseconds)
pub const DEFAULT_DISCOVERY_REFRESH_INTERVAL_MS: u64 = 60_000;

pub const HOST_PORT_SEPARATOR: char = ':';
pub const STATIC_ADDRESS_SEPARATOR: char = ';';
pub const HTTP_SCHEME: &str = "http://";
pub const HTTPS_SCHEME: &str = "https://";

// ----------------------------------------------------------------------------
// Query Gateway
// ----------------------------------------------------------------------------

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_BIND_PORT: u16 = 10080;

/// Pending connection queue of the listening socket
pub const DEFAULT_BACKLOG: u32 = 100;

/// Worker threads serving HTTP requests
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Requests per second admitted by each endpoint limiter
pub const DEFAULT_LIMITER_QPS: u32 = 100;

/// Status written for every response; failures are reported in the body
pub const DEFAULT_RESPONSE_STATUS: u16 = 200;

pub const CONTENT_TYPE_JSON: &str = "application/json;charset=utf-8";

pub const DEFAULT_DAY_PATH: &str = "/audit/query/day";
pub const DEFAULT_HOUR_PATH: &str = "/audit/query/hour";
pub const DEFAULT_MINUTES_PATH: &str = "/audit/query/minutes";
pub const DEFAULT_GET_IDS_PATH: &str = "/audit/query/getIds";
pub const DEFAULT_GET_IPS_PATH: &str = "/audit/query/getIps";
pub const DEFAULT_METRICS_PATH: &str = "/metrics";
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// Tag substituted when a query omits one
pub const DEFAULT_AUDIT_TAG: &str = "-1";

pub const CACHE_KEY_SEPARATOR: &str = "|";
pub const INVALID_PARAMS_MESSAGE: &str = "Invalid params! ";
pub const QUERY_FAILED_MESSAGE: &str = "Query failed! ";

pub const PARAM_START: &str = "start";
pub const PARAM_END: &str = "end";
pub const PARAM_METRIC_ID: &str = "metricId";
pub const PARAM_GROUP_ID: &str = "groupId";
pub const PARAM_STREAM_ID: &str = "streamId";
pub const PARAM_IP: &str = "ip";
pub const PARAM_CYCLE: &str = "cycle";
pub const PARAM_TAG: &str = "tag";

// ----------------------------------------------------------------------------
// Refresh Health
// ----------------------------------------------------------------------------

/// Consecutive failed cycles after which a snapshot is reported stale
pub const CONSECUTIVE_FAILURE_THRESHOLD: u32 = 3;

/// Refresh cycles slower than this are logged (milliseconds)
pub const SLOW_REFRESH_THRESHOLD_MS: u64 = 5_000;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Value types shared across the three components:
// - Data-source records and the per-service directory
// - Collector addresses and requesting components
// - Endpoint and cycle enums driving gateway dispatch
// - Statistic records, queries and the response envelope
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Data Sources
// ----------------------------------------------------------------------------

/// Connection settings of one audit data source.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub driver_class: String,
    pub url: String,
    pub username: String,
    pub password: String,
}

impl DataSourceConfig {
    pub fn new(
        driver_class: impl Into<String>,
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            driver_class: driver_class.into(),
            url: url.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Debug for DataSourceConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceConfig")
            .field("driver_class", &self.driver_class)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One row of the data-source query: a config tagged with its owning service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceRow {
    pub service_id: String,
    pub config: DataSourceConfig,
}

/// Data sources grouped by service id.
///
/// Always built as a complete value and published whole; never edited after
/// construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataSourceDirectory {
    services: BTreeMap<String, Vec<DataSourceConfig>>,
}

impl DataSourceDirectory {
    /// Group rows by service id, keeping row order within each service.
    pub fn from_rows(rows: impl IntoIterator<Item = DataSourceRow>) -> Self {
        let mut services: BTreeMap<String, Vec<DataSourceConfig>> = BTreeMap::new();
        for row in rows {
            services.entry(row.service_id).or_default().push(row.config);
        }
        Self { services }
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Number of distinct services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn get(&self, service_id: &str) -> Option<&[DataSourceConfig]> {
        self.services.get(service_id).map(Vec::as_slice)
    }

    /// All configs across every service.
    pub fn flatten(&self) -> Vec<DataSourceConfig> {
        self.services.values().flatten().cloned().collect()
    }

    pub fn service_ids(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Collector Addresses
// ----------------------------------------------------------------------------

/// A selected collector endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectorAddress {
    pub host: String,
    pub port: u16,
}

impl CollectorAddress {
    /// Parse a `host:port` entry. Anything other than exactly one separator
    /// followed by a valid port is rejected.
    pub fn parse(entry: &str) -> Option<Self> {
        let mut parts = entry.split(HOST_PORT_SEPARATOR);
        let host = parts.next()?;
        let port = parts.next()?;
        if parts.next().is_some() || host.is_empty() {
            return None;
        }
        let port = port.parse::<u16>().ok()?;
        Some(Self { host: host.to_string(), port })
    }
}

impl Display for CollectorAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.host, HOST_PORT_SEPARATOR, self.port)
    }
}

/// Component on whose behalf collector addresses are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditComponent {
    Agent,
    DataProxy,
    Sort,
    Common,
}

impl AuditComponent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditComponent::Agent => "Agent",
            AuditComponent::DataProxy => "DataProxy",
            AuditComponent::Sort => "Sort",
            AuditComponent::Common => "Common",
        }
    }
}

impl Display for AuditComponent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditComponent {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "agent" => Ok(AuditComponent::Agent),
            "dataproxy" => Ok(AuditComponent::DataProxy),
            "sort" => Ok(AuditComponent::Sort),
            "common" => Ok(AuditComponent::Common),
            other => Err(ConfigError::invalid_value(
                "discovery.component",
                format!("unknown component '{}'", other),
            )),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.3 Endpoint & Cycle Types
// ----------------------------------------------------------------------------

/// The five query endpoints exposed by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointType {
    ByDay,
    ByHour,
    ByMinuteGranularity,
    LookupIdsByIp,
    LookupIpsByStream,
}

impl EndpointType {
    pub const ALL: [EndpointType; 5] = [
        EndpointType::ByDay,
        EndpointType::ByHour,
        EndpointType::ByMinuteGranularity,
        EndpointType::LookupIdsByIp,
        EndpointType::LookupIpsByStream,
    ];

    /// Parameters that must be present before a request is routed.
    pub fn required_params(&self) -> &'static [&'static str] {
        match self {
            EndpointType::ByDay | EndpointType::ByHour | EndpointType::LookupIpsByStream => {
                &[PARAM_START, PARAM_END, PARAM_METRIC_ID, PARAM_GROUP_ID, PARAM_STREAM_ID]
            }
            EndpointType::ByMinuteGranularity => &[
                PARAM_START,
                PARAM_END,
                PARAM_METRIC_ID,
                PARAM_GROUP_ID,
                PARAM_STREAM_ID,
                PARAM_CYCLE,
            ],
            EndpointType::LookupIdsByIp => &[PARAM_START, PARAM_END, PARAM_METRIC_ID, PARAM_IP],
        }
    }

    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::ByDay => "day",
            EndpointType::ByHour => "hour",
            EndpointType::ByMinuteGranularity => "minutes",
            EndpointType::LookupIdsByIp => "get_ids",
            EndpointType::LookupIpsByStream => "get_ips",
        }
    }
}

impl Display for EndpointType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time-bucket width of a statistics query, in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditCycle {
    Minute,
    Minute5,
    Minute10,
    Minute30,
    Hour,
    Day,
}

impl AuditCycle {
    pub fn from_minutes(minutes: u32) -> Option<Self> {
        match minutes {
            1 => Some(AuditCycle::Minute),
            5 => Some(AuditCycle::Minute5),
            10 => Some(AuditCycle::Minute10),
            30 => Some(AuditCycle::Minute30),
            60 => Some(AuditCycle::Hour),
            1440 => Some(AuditCycle::Day),
            _ => None,
        }
    }

    /// Parse the raw `cycle` query parameter.
    pub fn from_param(raw: &str) -> Option<Self> {
        raw.trim().parse::<u32>().ok().and_then(Self::from_minutes)
    }

    pub fn minutes(&self) -> u32 {
        match self {
            AuditCycle::Minute => 1,
            AuditCycle::Minute5 => 5,
            AuditCycle::Minute10 => 10,
            AuditCycle::Minute30 => 30,
            AuditCycle::Hour => 60,
            AuditCycle::Day => 1440,
        }
    }
}

// ----------------------------------------------------------------------------
// 3.4 Statistics Records & Queries
// ----------------------------------------------------------------------------

/// One aggregated audit statistic as returned to query clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatData {
    pub log_ts: String,
    pub group_id: String,
    pub stream_id: String,
    pub metric_id: String,
    pub tag: String,
    pub count: i64,
    pub size: i64,
    pub delay: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// Stream-scoped query used by the cache tiers and the stream lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatQuery {
    pub start: String,
    pub end: String,
    pub metric_id: String,
    pub group_id: String,
    pub stream_id: String,
    pub tag: String,
}

impl StatQuery {
    /// Composite key under which cache tiers store precomputed buckets.
    pub fn cache_key(&self) -> String {
        build_cache_key(&self.start, &self.group_id, &self.stream_id, &self.metric_id)
    }
}

pub fn build_cache_key(start: &str, group_id: &str, stream_id: &str, metric_id: &str) -> String {
    [start, group_id, stream_id, metric_id].join(CACHE_KEY_SEPARATOR)
}

/// Query for metric ids reported from one ip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpQuery {
    pub start: String,
    pub end: String,
    pub metric_id: String,
    pub ip: String,
    pub tag: String,
}

// ----------------------------------------------------------------------------
// 3.5 Response Envelope
// ----------------------------------------------------------------------------

/// Uniform body of every gateway response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(rename = "errMsg")]
    pub err_msg: String,
    pub data: Vec<StatData>,
}

impl ApiResponse {
    pub fn success(data: Vec<StatData>) -> Self {
        Self { success: true, err_msg: String::new(), data }
    }

    pub fn failure(err_msg: impl Into<String>) -> Self {
        Self { success: false, err_msg: err_msg.into(), data: Vec::new() }
    }

    pub fn invalid_params(request_uri: &str) -> Self {
        Self::failure(format!("{}{}", INVALID_PARAMS_MESSAGE, request_uri))
    }

    pub fn query_failed(request_uri: &str) -> Self {
        Self::failure(format!("{}{}", QUERY_FAILED_MESSAGE, request_uri))
    }
}

// ----------------------------------------------------------------------------
// 3.6 Refresh Outcomes
// ----------------------------------------------------------------------------

/// Result of one refresh attempt that reached the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new snapshot with this many entries was published
    Published(usize),
    /// The source returned nothing usable; the previous snapshot stays live
    Retained,
}

impl RefreshOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, RefreshOutcome::Published(_))
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// One error enum per subsystem, all convertible into `AuditError`.
// Background refresh errors are logged and contained by their component;
// only bootstrap errors ever reach the process entry point.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Service Errors
// ----------------------------------------------------------------------------

/// The main error type of the audit control plane.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Tier error: {0}")]
    Tier(#[from] TierError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuditError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            AuditError::Config(_) => false,
            AuditError::Store(e) => e.is_recoverable(),
            AuditError::Discovery(e) => e.is_recoverable(),
            AuditError::Tier(e) => e.is_recoverable(),
            AuditError::Gateway(e) => e.is_recoverable(),
            AuditError::Io(_) => true,
            AuditError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            AuditError::Config(_) => "config",
            AuditError::Store(_) => "store",
            AuditError::Discovery(_) => "discovery",
            AuditError::Tier(_) => "tier",
            AuditError::Gateway(_) => "gateway",
            AuditError::Io(_) => "io",
            AuditError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue { field: field.into(), message: message.into() }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField { field: field.into() }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Store Errors
// ----------------------------------------------------------------------------

/// Errors raised while talking to the backing relational store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to connect to store: {message}")]
    Connect { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Connection pool is closed")]
    Closed,

    #[error("Invalid row: {message}")]
    InvalidRow { message: String },
}

impl StoreError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StoreError::InvalidRow { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolClosed => StoreError::Closed,
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                StoreError::Connect { message: e.to_string() }
            }
            sqlx::Error::Configuration(_) => StoreError::Connect { message: e.to_string() },
            other => StoreError::Query { message: other.to_string() },
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Discovery Errors
// ----------------------------------------------------------------------------

/// Errors raised by the discovery client
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Discovery endpoint is not configured")]
    NotConfigured,

    #[error("Invalid manager url '{url}': {message}")]
    InvalidManagerUrl { url: String, message: String },

    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Manager returned HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("Unusable manager response: {message}")]
    InvalidResponse { message: String },
}

impl DiscoveryError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DiscoveryError::InvalidManagerUrl { .. })
    }
}

// ----------------------------------------------------------------------------
// 4.5 Tier & Gateway Errors
// ----------------------------------------------------------------------------

/// Errors raised by statistic tier collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TierError {
    #[error("Tier '{tier}' is unavailable")]
    Unavailable { tier: String },

    #[error("Tier '{tier}' query failed: {message}")]
    Query { tier: String, message: String },
}

impl TierError {
    pub fn is_recoverable(&self) -> bool {
        true
    }
}

/// Errors raised by the HTTP gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Missing required parameters: {missing:?}")]
    InvalidParams { missing: Vec<&'static str> },

    #[error("Failed to serialize response: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl GatewayError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, GatewayError::InvalidParams { .. } | GatewayError::Serialization(_))
    }
}

// ----------------------------------------------------------------------------
// 4.6 Result Type Aliases
// ----------------------------------------------------------------------------

pub type AuditResult<T> = Result<T, AuditError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
pub type TierResult<T> = Result<T, TierError>;
pub type GatewayResult<T> = Result<T, GatewayError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// - TOML file parsing
// - Environment variable overrides (AUDIT_ prefix, `__` as section separator)
// - Validation
// - Sensible defaults for every field
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration for the audit service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Backing relational store
    #[serde(default)]
    pub store: StoreConfig,

    /// Config sync schedule
    #[serde(default)]
    pub config_sync: ConfigSyncConfig,

    /// Collector discovery
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// HTTP query gateway
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound { path: path.to_path_buf() });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::ParseError { message: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| ConfigError::ParseError { message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        self.config_sync.validate()?;
        self.discovery.validate()?;
        self.api.validate()?;
        Ok(())
    }

    /// Render the defaults as a TOML document
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Store Configuration
// ----------------------------------------------------------------------------

/// Connection and query settings of the config store
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub url: String,

    #[serde(default = "default_store_username")]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_store_pool_size")]
    pub pool_size: u32,

    #[serde(default = "default_store_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Cache prepared statements per connection
    #[serde(default = "default_true")]
    pub cache_prep_stmts: bool,

    #[serde(default = "default_prep_stmt_cache_size")]
    pub prep_stmt_cache_size: usize,

    /// Query returning one metric identifier per row
    #[serde(default = "default_metric_ids_sql")]
    pub metric_ids_sql: String,

    /// Query returning (driver, url, user, password, service id) rows
    #[serde(default = "default_data_sources_sql")]
    pub data_sources_sql: String,
}

fn default_store_url() -> String { DEFAULT_STORE_URL.into() }
fn default_store_username() -> String { DEFAULT_STORE_USERNAME.into() }
fn default_store_pool_size() -> u32 { DEFAULT_STORE_POOL_SIZE }
fn default_store_connection_timeout_ms() -> u64 { DEFAULT_STORE_CONNECTION_TIMEOUT_MS }
fn default_true() -> bool { true }
fn default_prep_stmt_cache_size() -> usize { DEFAULT_PREP_STMT_CACHE_SIZE }
fn default_metric_ids_sql() -> String { DEFAULT_METRIC_IDS_SQL.into() }
fn default_data_sources_sql() -> String { DEFAULT_DATA_SOURCES_SQL.into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            username: default_store_username(),
            password: String::new(),
            pool_size: default_store_pool_size(),
            connection_timeout_ms: default_store_connection_timeout_ms(),
            cache_prep_stmts: true,
            prep_stmt_cache_size: default_prep_stmt_cache_size(),
            metric_ids_sql: default_metric_ids_sql(),
            data_sources_sql: default_data_sources_sql(),
        }
    }
}

impl Debug for StoreConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("pool_size", &self.pool_size)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("cache_prep_stmts", &self.cache_prep_stmts)
            .field("prep_stmt_cache_size", &self.prep_stmt_cache_size)
            .field("metric_ids_sql", &self.metric_ids_sql)
            .field("data_sources_sql", &self.data_sources_sql)
            .finish()
    }
}

impl StoreConfig {
    /// Store URL with any JDBC prefix removed.
    pub fn connection_url(&self) -> &str {
        self.url.strip_prefix(JDBC_URL_PREFIX).unwrap_or(&self.url)
    }

    /// Statement cache capacity; zero disables caching.
    pub fn statement_cache_capacity(&self) -> usize {
        if self.cache_prep_stmts {
            self.prep_stmt_cache_size
        } else {
            0
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::missing_field("store.url"));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::invalid_value("store.pool_size", "Pool size must be at least 1"));
        }
        if self.connection_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "store.connection_timeout_ms",
                "Connection timeout must be positive",
            ));
        }
        if self.metric_ids_sql.trim().is_empty() {
            return Err(ConfigError::missing_field("store.metric_ids_sql"));
        }
        if self.data_sources_sql.trim().is_empty() {
            return Err(ConfigError::missing_field("store.data_sources_sql"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 5.3 Config Sync Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSyncConfig {
    /// Delay between the end of one refresh cycle and the start of the next
    #[serde(default = "default_config_update_interval_secs")]
    pub update_interval_secs: u64,
}

fn default_config_update_interval_secs() -> u64 { DEFAULT_CONFIG_UPDATE_INTERVAL_SECS }

impl Default for ConfigSyncConfig {
    fn default() -> Self {
        Self { update_interval_secs: default_config_update_interval_secs() }
    }
}

impl ConfigSyncConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.update_interval_secs == 0 {
            return Err(ConfigError::invalid_value(
                "config_sync.update_interval_secs",
                "Update interval must be positive",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 5.4 Discovery Configuration
// ----------------------------------------------------------------------------

/// Collector discovery settings. Discovery stays idle without a manager host.
#[derive(Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub manager_host: Option<String>,

    #[serde(default = "default_component")]
    pub component: AuditComponent,

    #[serde(default)]
    pub secret_id: Option<String>,

    #[serde(default)]
    pub secret_key: Option<String>,

    #[serde(default)]
    pub auto_refresh: bool,

    #[serde(default = "default_discovery_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    #[serde(default = "default_discovery_timeout_ms")]
    pub request_timeout_ms: u64,

    /// `host:port` entries separated by `;`, published before the first pull
    #[serde(default)]
    pub static_addresses: String,
}

fn default_component() -> AuditComponent { AuditComponent::Common }
fn default_discovery_refresh_interval_ms() -> u64 { DEFAULT_DISCOVERY_REFRESH_INTERVAL_MS }
fn default_discovery_timeout_ms() -> u64 { DEFAULT_DISCOVERY_TIMEOUT_MS }

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            manager_host: None,
            component: default_component(),
            secret_id: None,
            secret_key: None,
            auto_refresh: false,
            refresh_interval_ms: default_discovery_refresh_interval_ms(),
            request_timeout_ms: default_discovery_timeout_ms(),
            static_addresses: String::new(),
        }
    }
}

impl Debug for DiscoveryConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryConfig")
            .field("manager_host", &self.manager_host)
            .field("component", &self.component)
            .field("secret_id", &self.secret_id)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("auto_refresh", &self.auto_refresh)
            .field("refresh_interval_ms", &self.refresh_interval_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("static_addresses", &self.static_addresses)
            .finish()
    }
}

impl DiscoveryConfig {
    /// Basic auth material, present only when both halves are set.
    pub fn auth(&self) -> Option<AuthConfig> {
        match (&self.secret_id, &self.secret_key) {
            (Some(id), Some(key)) => Some(AuthConfig::new(id.clone(), key.clone())),
            _ => None,
        }
    }

    pub fn static_address_set(&self) -> HashSet<String> {
        parse_static_addresses(&self.static_addresses)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval_ms == 0 {
            return Err(ConfigError::invalid_value(
                "discovery.refresh_interval_ms",
                "Refresh interval must be positive",
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "discovery.request_timeout_ms",
                "Request timeout must be positive",
            ));
        }
        if self.secret_id.is_some() != self.secret_key.is_some() {
            return Err(ConfigError::invalid_value(
                "discovery.secret_key",
                "secret_id and secret_key must be set together",
            ));
        }
        if let Some(host) = &self.manager_host {
            if host.trim().is_empty() {
                return Err(ConfigError::invalid_value("discovery.manager_host", "Manager host is empty"));
            }
        }
        Ok(())
    }
}

/// Split a `;`-separated address list, dropping blanks.
pub fn parse_static_addresses(raw: &str) -> HashSet<String> {
    raw.split(STATIC_ADDRESS_SEPARATOR)
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(String::from)
        .collect()
}

/// Credentials presented to the manager.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub secret_id: String,
    pub secret_key: String,
}

impl AuthConfig {
    pub fn new(secret_id: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self { secret_id: secret_id.into(), secret_key: secret_key.into() }
    }
}

impl Debug for AuthConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 5.5 API Configuration
// ----------------------------------------------------------------------------

/// HTTP query gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Worker threads of the request-serving runtime
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Requests per second admitted by each endpoint
    #[serde(default = "default_limiter_qps")]
    pub limiter_qps: u32,

    #[serde(default = "default_response_status")]
    pub response_status: u16,

    #[serde(default = "default_day_path")]
    pub day_path: String,

    #[serde(default = "default_hour_path")]
    pub hour_path: String,

    #[serde(default = "default_minutes_path")]
    pub minutes_path: String,

    #[serde(default = "default_get_ids_path")]
    pub get_ids_path: String,

    #[serde(default = "default_get_ips_path")]
    pub get_ips_path: String,

    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_bind_address() -> String { DEFAULT_BIND_ADDRESS.into() }
fn default_bind_port() -> u16 { DEFAULT_BIND_PORT }
fn default_backlog() -> u32 { DEFAULT_BACKLOG }
fn default_pool_size() -> usize { DEFAULT_POOL_SIZE }
fn default_limiter_qps() -> u32 { DEFAULT_LIMITER_QPS }
fn default_response_status() -> u16 { DEFAULT_RESPONSE_STATUS }
fn default_day_path() -> String { DEFAULT_DAY_PATH.into() }
fn default_hour_path() -> String { DEFAULT_HOUR_PATH.into() }
fn default_minutes_path() -> String { DEFAULT_MINUTES_PATH.into() }
fn default_get_ids_path() -> String { DEFAULT_GET_IDS_PATH.into() }
fn default_get_ips_path() -> String { DEFAULT_GET_IPS_PATH.into() }
fn default_metrics_path() -> String { DEFAULT_METRICS_PATH.into() }
fn default_health_path() -> String { DEFAULT_HEALTH_PATH.into() }

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            backlog: default_backlog(),
            pool_size: default_pool_size(),
            limiter_qps: default_limiter_qps(),
            response_status: default_response_status(),
            day_path: default_day_path(),
            hour_path: default_hour_path(),
            minutes_path: default_minutes_path(),
            get_ids_path: default_get_ids_path(),
            get_ips_path: default_get_ips_path(),
            metrics_path: default_metrics_path(),
            health_path: default_health_path(),
        }
    }
}

impl ApiConfig {
    pub fn path_for(&self, endpoint: EndpointType) -> &str {
        match endpoint {
            EndpointType::ByDay => &self.day_path,
            EndpointType::ByHour => &self.hour_path,
            EndpointType::ByMinuteGranularity => &self.minutes_path,
            EndpointType::LookupIdsByIp => &self.get_ids_path,
            EndpointType::LookupIpsByStream => &self.get_ips_path,
        }
    }

    /// Validated status code, falling back to 200 for out-of-range values.
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.response_status).unwrap_or(StatusCode::OK)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_address, self.bind_port)
            .parse()
            .map_err(|e| ConfigError::invalid_value("api.bind_address", format!("{}", e)))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_port == 0 {
            return Err(ConfigError::invalid_value("api.bind_port", "Bind port must be non-zero"));
        }
        self.socket_addr()?;
        if self.backlog == 0 {
            return Err(ConfigError::invalid_value("api.backlog", "Backlog must be at least 1"));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::invalid_value("api.pool_size", "Worker pool must have at least 1 thread"));
        }
        if self.limiter_qps == 0 {
            return Err(ConfigError::invalid_value("api.limiter_qps", "Limiter QPS must be positive"));
        }
        if StatusCode::from_u16(self.response_status).is_err() {
            return Err(ConfigError::invalid_value(
                "api.response_status",
                format!("{} is not a valid HTTP status", self.response_status),
            ));
        }

        let paths = [
            ("api.day_path", &self.day_path),
            ("api.hour_path", &self.hour_path),
            ("api.minutes_path", &self.minutes_path),
            ("api.get_ids_path", &self.get_ids_path),
            ("api.get_ips_path", &self.get_ips_path),
            ("api.metrics_path", &self.metrics_path),
            ("api.health_path", &self.health_path),
        ];
        let mut seen = HashSet::new();
        for (field, path) in paths {
            if !path.starts_with('/') {
                return Err(ConfigError::invalid_value(field, "Path must start with '/'"));
            }
            if !seen.insert(path.as_str()) {
                return Err(ConfigError::invalid_value(field, format!("Path '{}' is already bound", path)));
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 5.6 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// json, compact or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include file and line in log output
    #[serde(default)]
    pub source_location: bool,
}

fn default_log_level() -> String { "info".into() }
fn default_log_format() -> String { "pretty".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> AuditResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let result = match config.format.as_str() {
        "json" => tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            ),
        ),
        "compact" => tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_fmt::layer().compact().with_ansi(config.colors).with_target(true)),
        ),
        _ => tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            ),
        ),
    };
    result.map_err(|e| AuditError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "audit::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 6.2 Performance Timer
// ----------------------------------------------------------------------------

/// Measures an operation and warns when it overruns its threshold.
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
}

impl PerfTimer {
    pub fn new(name: &'static str) -> Self {
        Self { name, start: Instant::now(), threshold_ms: None }
    }

    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self { name, start: Instant::now(), threshold_ms: Some(threshold_ms) }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();

        if let Some(threshold) = self.threshold_ms {
            if elapsed > threshold {
                warn!(
                    target: "audit::perf",
                    operation = self.name,
                    elapsed_ms = elapsed,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
            }
        }

        trace!(target: "audit::perf", operation = self.name, elapsed_ms = elapsed, "Operation completed");
        elapsed
    }
}

// ============================================================================
// SECTION 7: BACKGROUND REFRESH PRIMITIVES
// ============================================================================
// - Fixed-delay periodic task bound to its owner's lifecycle
// - Refresh health tracking shared by every self-refreshing component
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Periodic Task
// ----------------------------------------------------------------------------

/// A single background task running a job with fixed delay between runs.
///
/// The next run is scheduled relative to the completion of the previous one,
/// so runs of one task never overlap. The task ends when the job returns
/// `false`, when `stop` is called, or when the `PeriodicTask` is dropped.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<TokioJoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn on the current tokio runtime.
    pub fn spawn_fixed_delay<F, Fut>(
        name: &'static str,
        initial_delay: Duration,
        delay: Duration,
        mut job: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            if !initial_delay.is_zero() {
                tokio::select! {
                    _ = sleep(initial_delay) => {}
                    _ = token.cancelled() => return,
                }
            }

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    keep_running = job() => {
                        if !keep_running {
                            break;
                        }
                    }
                }
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }

            debug!(target: "audit::task", task = name, "Periodic task stopped");
        });

        debug!(
            target: "audit::task",
            task = name,
            initial_delay_ms = initial_delay.as_millis() as u64,
            delay_ms = delay.as_millis() as u64,
            "Periodic task scheduled"
        );

        Self { name, cancel, handle: Some(handle) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(TokioJoinHandle::is_finished).unwrap_or(true)
    }

    /// Cancel and wait for the task to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(target: "audit::task", task = self.name, "Periodic task panicked");
                }
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ----------------------------------------------------------------------------
// 7.2 Refresh Health
// ----------------------------------------------------------------------------

/// Freshness of a component's published snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    /// No cycle has completed yet
    Unknown,
    /// Last cycle succeeded
    Healthy,
    /// Recent cycles failed; snapshot is still recent
    Degraded,
    /// Failures reached the threshold; snapshot may be arbitrarily old
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshHealth {
    pub status: RefreshStatus,
    pub cycles: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub last_duration_ms: u64,
}

impl Default for RefreshHealth {
    fn default() -> Self {
        Self {
            status: RefreshStatus::Unknown,
            cycles: 0,
            failures: 0,
            consecutive_failures: 0,
            last_success: None,
            last_error: None,
            last_error_message: None,
            last_duration_ms: 0,
        }
    }
}

/// Records the outcome of each refresh cycle for one component.
#[derive(Debug)]
pub struct RefreshTracker {
    component: &'static str,
    health: RwLock<RefreshHealth>,
}

impl RefreshTracker {
    pub fn new(component: &'static str) -> Self {
        Self { component, health: RwLock::new(RefreshHealth::default()) }
    }

    pub fn record_success(&self, duration_ms: u64) {
        let mut health = self.health.write();
        if health.consecutive_failures >= CONSECUTIVE_FAILURE_THRESHOLD {
            info!(
                target: "audit::health",
                component = self.component,
                failed_cycles = health.consecutive_failures,
                "Refresh recovered"
            );
        }
        health.status = RefreshStatus::Healthy;
        health.cycles += 1;
        health.consecutive_failures = 0;
        health.last_success = Some(Utc::now());
        health.last_duration_ms = duration_ms;
    }

    /// Returns the consecutive failure count after recording.
    pub fn record_failure(&self, message: impl Into<String>, duration_ms: u64) -> u32 {
        let mut health = self.health.write();
        health.cycles += 1;
        health.failures += 1;
        health.consecutive_failures += 1;
        health.last_error = Some(Utc::now());
        health.last_error_message = Some(message.into());
        health.last_duration_ms = duration_ms;

        if health.consecutive_failures >= CONSECUTIVE_FAILURE_THRESHOLD {
            health.status = RefreshStatus::Stale;
            warn!(
                target: "audit::health",
                component = self.component,
                consecutive_failures = health.consecutive_failures,
                last_success = ?health.last_success,
                "Refresh keeps failing, serving stale snapshot"
            );
        } else {
            health.status = RefreshStatus::Degraded;
        }
        health.consecutive_failures
    }

    pub fn health(&self) -> RefreshHealth {
        self.health.read().clone()
    }
}

// ============================================================================
// SECTION 8: CONFIG SYNC ENGINE
// ============================================================================
// Periodically pulls metric identifiers and per-service data sources from the
// backing store and publishes them as immutable snapshots:
// - Each snapshot is built completely, then swapped in with one store
// - Empty or failed results never replace a published snapshot
// - A closed pool is rebuilt lazily at the start of a refresh
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Config Store Trait
// ----------------------------------------------------------------------------

/// Read access to the relational store holding service configuration.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Whether the underlying pool has been closed.
    fn is_closed(&self) -> bool;

    /// Replace the underlying pool with a freshly built one.
    async fn reconnect(&self) -> StoreResult<()>;

    async fn fetch_metric_ids(&self) -> StoreResult<Vec<String>>;

    async fn fetch_data_sources(&self) -> StoreResult<Vec<DataSourceRow>>;

    async fn close(&self);
}

// ----------------------------------------------------------------------------
// 8.2 SQL Config Store
// ----------------------------------------------------------------------------

/// `ConfigStore` backed by a pooled MySQL connection.
#[derive(Debug)]
pub struct SqlConfigStore {
    config: StoreConfig,
    pool: RwLock<MySqlPool>,
}

impl SqlConfigStore {
    /// Build the store. Connections are opened lazily on first query, so
    /// this never blocks on the network; it must run inside a tokio runtime.
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        let pool = Self::build_pool(&config)?;
        info!(
            target: "audit::config_sync",
            url = %config.connection_url(),
            pool_size = config.pool_size,
            statement_cache = config.statement_cache_capacity(),
            "Config store pool created"
        );
        Ok(Self { config, pool: RwLock::new(pool) })
    }

    fn build_pool(config: &StoreConfig) -> StoreResult<MySqlPool> {
        let options = MySqlConnectOptions::from_str(config.connection_url())?
            .username(&config.username)
            .password(&config.password)
            .statement_cache_capacity(config.statement_cache_capacity());

        Ok(MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.connection_timeout())
            .connect_lazy_with(options))
    }

    fn pool(&self) -> MySqlPool {
        self.pool.read().clone()
    }
}

/// Read a text column that may be stored as a string or an integer.
fn column_as_string(row: &sqlx::mysql::MySqlRow, index: usize) -> StoreResult<Option<String>> {
    match row.try_get::<Option<String>, _>(index) {
        Ok(value) => Ok(value),
        Err(_) => Ok(row.try_get::<Option<i64>, _>(index)?.map(|n| n.to_string())),
    }
}

#[async_trait]
impl ConfigStore for SqlConfigStore {
    fn is_closed(&self) -> bool {
        self.pool.read().is_closed()
    }

    async fn reconnect(&self) -> StoreResult<()> {
        let fresh = Self::build_pool(&self.config)?;
        let stale = std::mem::replace(&mut *self.pool.write(), fresh);
        stale.close().await;
        info!(target: "audit::config_sync", url = %self.config.connection_url(), "Config store pool rebuilt");
        Ok(())
    }

    async fn fetch_metric_ids(&self) -> StoreResult<Vec<String>> {
        let pool = self.pool();
        let rows = sqlx::query(&self.config.metric_ids_sql).fetch_all(&pool).await?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            match column_as_string(row, 0)? {
                Some(id) => ids.push(id),
                None => warn!(target: "audit::config_sync", "Skipping metric id row with NULL value"),
            }
        }
        Ok(ids)
    }

    async fn fetch_data_sources(&self) -> StoreResult<Vec<DataSourceRow>> {
        let pool = self.pool();
        let rows = sqlx::query(&self.config.data_sources_sql).fetch_all(&pool).await?;

        let mut sources = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(service_id) = column_as_string(row, 4)? else {
                warn!(target: "audit::config_sync", "Skipping data source row without service id");
                continue;
            };
            let config = DataSourceConfig {
                driver_class: column_as_string(row, 0)?.unwrap_or_default(),
                url: column_as_string(row, 1)?.unwrap_or_default(),
                username: column_as_string(row, 2)?.unwrap_or_default(),
                password: column_as_string(row, 3)?.unwrap_or_default(),
            };
            sources.push(DataSourceRow { service_id, config });
        }
        Ok(sources)
    }

    async fn close(&self) {
        let pool = self.pool();
        pool.close().await;
    }
}

// ----------------------------------------------------------------------------
// 8.3 Config Sync Engine
// ----------------------------------------------------------------------------

/// Self-refreshing, fail-safe cache of metric identifiers and data sources.
pub struct ConfigSyncEngine {
    store: Arc<dyn ConfigStore>,
    update_interval: Duration,
    metric_ids: ArcSwap<Vec<String>>,
    directory: ArcSwap<DataSourceDirectory>,
    tracker: RefreshTracker,
    timer: Mutex<Option<PeriodicTask>>,
}

impl Debug for ConfigSyncEngine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigSyncEngine")
            .field("update_interval", &self.update_interval)
            .field("metric_ids", &self.metric_ids.load().len())
            .field("services", &self.directory.load().len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl ConfigSyncEngine {
    pub fn new(store: Arc<dyn ConfigStore>, config: &ConfigSyncConfig) -> Self {
        Self {
            store,
            update_interval: config.update_interval(),
            metric_ids: ArcSwap::from_pointee(Vec::new()),
            directory: ArcSwap::from_pointee(DataSourceDirectory::default()),
            tracker: RefreshTracker::new("config_sync"),
            timer: Mutex::new(None),
        }
    }

    /// Schedule the refresh loop; the first cycle runs immediately.
    /// Returns false if the loop was already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            warn!(target: "audit::config_sync", "Config sync already started");
            return false;
        }

        let engine: Weak<Self> = Arc::downgrade(self);
        *timer = Some(PeriodicTask::spawn_fixed_delay(
            "config_sync",
            Duration::ZERO,
            self.update_interval,
            move || {
                let engine = engine.clone();
                async move {
                    match engine.upgrade() {
                        Some(engine) => {
                            engine.refresh_once().await;
                            true
                        }
                        None => false,
                    }
                }
            },
        ));

        info!(
            target: "audit::config_sync",
            interval_secs = self.update_interval.as_secs(),
            "Config sync started"
        );
        true
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Run one identifier refresh followed by one data-source refresh.
    /// Returns true when both completed without error.
    pub async fn refresh_once(&self) -> bool {
        let timer = PerfTimer::with_threshold("config_sync.refresh", SLOW_REFRESH_THRESHOLD_MS);

        let ids = self.refresh_metric_ids().await;
        let sources = self.refresh_data_sources().await;
        let elapsed = timer.stop();

        let mut errors = Vec::new();
        if let Err(e) = &ids {
            error!(target: "audit::config_sync", error = %e, "Metric id refresh failed");
            errors.push(e.to_string());
        }
        if let Err(e) = &sources {
            error!(target: "audit::config_sync", error = %e, "Data source refresh failed");
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            self.tracker.record_success(elapsed);
            true
        } else {
            self.tracker.record_failure(errors.join("; "), elapsed);
            false
        }
    }

    /// Pull metric identifiers and publish them if any were returned.
    pub async fn refresh_metric_ids(&self) -> StoreResult<RefreshOutcome> {
        self.ensure_connection().await?;
        let ids = self.store.fetch_metric_ids().await?;

        if ids.is_empty() {
            debug!(target: "audit::config_sync", "Store returned no metric ids, keeping current set");
            return Ok(RefreshOutcome::Retained);
        }

        let count = ids.len();
        self.metric_ids.store(Arc::new(ids));
        debug!(target: "audit::config_sync", count, "Metric ids published");
        Ok(RefreshOutcome::Published(count))
    }

    /// Pull data sources, group by service and publish if any were returned.
    pub async fn refresh_data_sources(&self) -> StoreResult<RefreshOutcome> {
        self.ensure_connection().await?;
        let rows = self.store.fetch_data_sources().await?;
        let directory = DataSourceDirectory::from_rows(rows);

        if directory.is_empty() {
            debug!(target: "audit::config_sync", "Store returned no data sources, keeping current directory");
            return Ok(RefreshOutcome::Retained);
        }

        let services = directory.len();
        self.directory.store(Arc::new(directory));
        debug!(target: "audit::config_sync", services, "Data source directory published");
        Ok(RefreshOutcome::Published(services))
    }

    async fn ensure_connection(&self) -> StoreResult<()> {
        if self.store.is_closed() {
            warn!(target: "audit::config_sync", "Store connection closed, rebuilding pool");
            self.store.reconnect().await?;
        }
        Ok(())
    }

    /// Current metric identifiers; empty until the first successful refresh.
    pub fn metric_identifiers(&self) -> Arc<Vec<String>> {
        self.metric_ids.load_full()
    }

    pub fn contains_metric(&self, metric_id: &str) -> bool {
        self.metric_ids.load().iter().any(|id| id == metric_id)
    }

    pub fn directory(&self) -> Arc<DataSourceDirectory> {
        self.directory.load_full()
    }

    pub fn all_data_sources(&self) -> Vec<DataSourceConfig> {
        self.directory.load().flatten()
    }

    /// `None` means the service is unknown, as opposed to known with no sources.
    pub fn data_sources_by_service(&self, service_id: &str) -> Option<Vec<DataSourceConfig>> {
        self.directory.load().get(service_id).map(<[DataSourceConfig]>::to_vec)
    }

    pub fn health(&self) -> RefreshHealth {
        self.tracker.health()
    }

    /// Stop the refresh loop and close the store.
    pub async fn shutdown(&self) {
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            timer.stop().await;
        }
        self.store.close().await;
        info!(target: "audit::config_sync", "Config sync stopped");
    }
}

// ============================================================================
// SECTION 9: DISCOVERY CLIENT
// ============================================================================
// Pulls the list of reachable collector addresses from the manager and
// offers uniform random selection over it:
// - Remote configuration is deferred until `configure` is called
// - The address list is replaced only when the observed set differs
// - Unusable manager responses leave the current list untouched
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Settings & Wire Types
// ----------------------------------------------------------------------------

/// Scheduling knobs read when `configure` runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySettings {
    pub auto_refresh: bool,
    pub refresh_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            auto_refresh: false,
            refresh_interval_ms: DEFAULT_DISCOVERY_REFRESH_INTERVAL_MS,
            request_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
        }
    }
}

impl From<&DiscoveryConfig> for DiscoverySettings {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            auto_refresh: config.auto_refresh,
            refresh_interval_ms: config.refresh_interval_ms,
            request_timeout_ms: config.request_timeout_ms,
        }
    }
}

#[derive(Debug, Clone)]
struct ManagerEndpoint {
    component: AuditComponent,
    url: String,
    auth: Option<AuthConfig>,
}

/// Envelope returned by the manager API.
#[derive(Debug, Deserialize)]
struct ManagerResponse<T> {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(rename = "errMsg", default)]
    err_msg: Option<String>,
    #[serde(default)]
    data: Option<T>,
}

/// One collector entry as published by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditProxy {
    pub host: String,
    pub port: u16,
}

impl Display for AuditProxy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.host, HOST_PORT_SEPARATOR, self.port)
    }
}

/// Normalize a manager host: ensure a trailing `/` and an http(s) scheme.
pub fn normalize_manager_url(manager_host: &str) -> DiscoveryResult<String> {
    let trimmed = manager_host.trim();
    if trimmed.is_empty() {
        return Err(DiscoveryError::InvalidManagerUrl {
            url: manager_host.to_string(),
            message: "manager host is empty".into(),
        });
    }

    let mut base = trimmed.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    if !base.starts_with(HTTP_SCHEME) && !base.starts_with(HTTPS_SCHEME) {
        base = format!("{}{}", HTTP_SCHEME, base);
    }
    Ok(base)
}

/// Full discovery endpoint for a manager host.
pub fn build_discovery_url(manager_host: &str) -> DiscoveryResult<String> {
    let base = normalize_manager_url(manager_host)?;
    let url = format!("{}{}", base, DISCOVERY_API_PATH.trim_start_matches('/'));
    reqwest::Url::parse(&url).map_err(|e| DiscoveryError::InvalidManagerUrl {
        url: url.clone(),
        message: e.to_string(),
    })?;
    Ok(url)
}

// ----------------------------------------------------------------------------
// 9.2 Discovery Client
// ----------------------------------------------------------------------------

/// Self-refreshing collector address list with random selection.
pub struct DiscoveryClient {
    http: HttpClient,
    settings: RwLock<DiscoverySettings>,
    endpoint: RwLock<Option<ManagerEndpoint>>,
    addresses: ArcSwap<Vec<String>>,
    update_lock: Mutex<()>,
    changes: watch::Sender<Arc<Vec<String>>>,
    timer_started: AtomicBool,
    timer: Mutex<Option<PeriodicTask>>,
    tracker: RefreshTracker,
}

impl Debug for DiscoveryClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryClient")
            .field("settings", &*self.settings.read())
            .field("endpoint", &self.endpoint.read().as_ref().map(|e| e.url.clone()))
            .field("addresses", &self.addresses.load().len())
            .field("timer_started", &self.timer_started.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

impl Default for DiscoveryClient {
    fn default() -> Self {
        Self::new(DiscoverySettings::default())
    }
}

impl DiscoveryClient {
    pub fn new(settings: DiscoverySettings) -> Self {
        let http = HttpClient::builder()
            .pool_max_idle_per_host(2)
            .build()
            .unwrap_or_default();
        let (changes, _) = watch::channel(Arc::new(Vec::new()));

        Self {
            http,
            settings: RwLock::new(settings),
            endpoint: RwLock::new(None),
            addresses: ArcSwap::from_pointee(Vec::new()),
            update_lock: Mutex::new(()),
            changes,
            timer_started: AtomicBool::new(false),
            timer: Mutex::new(None),
            tracker: RefreshTracker::new("discovery"),
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(DiscoverySettings::from(config))
    }

    // ---- Settings (take effect at the next `configure`) ----

    pub fn set_auto_refresh(&self, enabled: bool) {
        self.settings.write().auto_refresh = enabled;
    }

    pub fn set_refresh_interval_ms(&self, interval_ms: u64) {
        self.settings.write().refresh_interval_ms = interval_ms;
    }

    pub fn set_request_timeout_ms(&self, timeout_ms: u64) {
        self.settings.write().request_timeout_ms = timeout_ms;
    }

    pub fn settings(&self) -> DiscoverySettings {
        self.settings.read().clone()
    }

    /// The discovery URL in use, once configured.
    pub fn endpoint_url(&self) -> Option<String> {
        self.endpoint.read().as_ref().map(|e| e.url.clone())
    }

    /// Point the client at a manager, pull once, and start the refresh timer
    /// if auto refresh is enabled. Safe to call again; the timer is only
    /// ever scheduled once.
    pub async fn configure(
        self: &Arc<Self>,
        component: AuditComponent,
        manager_host: &str,
        auth: Option<AuthConfig>,
    ) -> DiscoveryResult<()> {
        let url = build_discovery_url(manager_host)?;
        info!(target: "audit::discovery", url = %url, component = %component, "Discovery endpoint configured");
        *self.endpoint.write() = Some(ManagerEndpoint { component, url, auth });

        self.refresh_cycle().await;

        if self.settings.read().auto_refresh {
            self.start_timer();
        }
        Ok(())
    }

    fn start_timer(self: &Arc<Self>) {
        if self
            .timer_started
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_err()
        {
            return;
        }

        let interval = Duration::from_millis(self.settings.read().refresh_interval_ms);
        let client: Weak<Self> = Arc::downgrade(self);
        let task = PeriodicTask::spawn_fixed_delay("discovery", interval, interval, move || {
            let client = client.clone();
            async move {
                match client.upgrade() {
                    Some(client) => {
                        client.refresh_cycle().await;
                        true
                    }
                    None => false,
                }
            }
        });
        *self.timer.lock() = Some(task);

        info!(target: "audit::discovery", interval_ms = interval.as_millis() as u64, "Discovery refresh started");
    }

    /// One pull with outcome recorded in the refresh health.
    pub async fn refresh_cycle(&self) {
        let timer = PerfTimer::with_threshold("discovery.refresh", SLOW_REFRESH_THRESHOLD_MS);
        let result = self.refresh().await;
        let elapsed = timer.stop();

        match result {
            Ok(_) => self.tracker.record_success(elapsed),
            Err(e) => {
                warn!(target: "audit::discovery", error = %e, "Collector address refresh failed");
                self.tracker.record_failure(e.to_string(), elapsed);
            }
        }
    }

    /// Pull the address list from the manager and publish it if it changed.
    pub async fn refresh(&self) -> DiscoveryResult<RefreshOutcome> {
        let endpoint = self.endpoint.read().clone().ok_or(DiscoveryError::NotConfigured)?;
        let timeout = Duration::from_millis(self.settings.read().request_timeout_ms);

        let mut request = self
            .http
            .get(&endpoint.url)
            .query(&[("component", endpoint.component.as_str())])
            .timeout(timeout);
        if let Some(auth) = &endpoint.auth {
            request = request.basic_auth(&auth.secret_id, Some(&auth.secret_key));
        }

        let response = request.send().await.map_err(|e| DiscoveryError::Request {
            url: endpoint.url.clone(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::HttpStatus { status: status.as_u16() });
        }

        let body = response.text().await.map_err(|e| DiscoveryError::Request {
            url: endpoint.url.clone(),
            message: e.to_string(),
        })?;
        let envelope: ManagerResponse<Vec<AuditProxy>> = serde_json::from_str(&body)
            .map_err(|e| DiscoveryError::InvalidResponse { message: e.to_string() })?;

        if !envelope.success {
            return Err(DiscoveryError::InvalidResponse {
                message: envelope.err_msg.unwrap_or_else(|| "manager reported failure".into()),
            });
        }
        let proxies = envelope.data.ok_or_else(|| DiscoveryError::InvalidResponse {
            message: "response carries no data".into(),
        })?;

        let observed: HashSet<String> = proxies.iter().map(ToString::to_string).collect();
        let count = observed.len();
        if self.set_addresses(observed) {
            info!(target: "audit::discovery", count, "Collector addresses updated");
            Ok(RefreshOutcome::Published(count))
        } else {
            debug!(target: "audit::discovery", count, "Collector addresses unchanged");
            Ok(RefreshOutcome::Retained)
        }
    }

    /// Replace the address list when `observed` differs from it as a set.
    /// Returns whether a new list was published.
    pub fn set_addresses(&self, observed: HashSet<String>) -> bool {
        let _guard = self.update_lock.lock();

        let current: HashSet<String> = self.addresses.load().iter().cloned().collect();
        if current == observed {
            return false;
        }

        let mut next: Vec<String> = observed.into_iter().collect();
        next.sort();
        let next = Arc::new(next);
        self.addresses.store(Arc::clone(&next));
        self.changes.send_replace(next);
        true
    }

    pub fn addresses(&self) -> Arc<Vec<String>> {
        self.addresses.load_full()
    }

    /// Receiver notified each time a different address list is published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<String>>> {
        self.changes.subscribe()
    }

    /// Pick a collector uniformly at random.
    pub fn select_address(&self) -> Option<CollectorAddress> {
        let addresses = self.addresses.load();
        let entry = addresses.choose(&mut rand::thread_rng())?;

        let address = CollectorAddress::parse(entry);
        if address.is_none() {
            warn!(target: "audit::discovery", entry = %entry, "Malformed collector address");
        }
        address
    }

    pub fn health(&self) -> RefreshHealth {
        self.tracker.health()
    }

    pub fn is_refreshing(&self) -> bool {
        self.timer_started.load(AtomicOrdering::Acquire)
    }

    /// Stop the refresh timer. A later `configure` may start it again.
    pub async fn shutdown(&self) {
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            timer.stop().await;
            info!(target: "audit::discovery", "Discovery refresh stopped");
        }
        self.timer_started.store(false, AtomicOrdering::Release);
    }
}

// ============================================================================
// SECTION 10: STATISTIC TIERS
// ============================================================================
// Narrow interfaces to the storage tiers the gateway routes to, plus
// in-process implementations used when no external tier is wired in.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Tier Traits
// ----------------------------------------------------------------------------

/// A precomputed cache tier (day, hour, 10-minute or 30-minute buckets).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatTier: Send + Sync {
    async fn get_data(&self, query: &StatQuery) -> TierResult<Vec<StatData>>;
}

/// The uncached real-time query path.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RealTimeQuery: Send + Sync {
    /// Minute-level records for one stream and metric.
    async fn query_log_ts(&self, query: &StatQuery) -> TierResult<Vec<StatData>>;

    /// Records reported from one ip.
    async fn query_ids_by_ip(&self, query: &IpQuery) -> TierResult<Vec<StatData>>;

    /// Reporting ips of one stream and metric.
    async fn query_report_ips(&self, query: &StatQuery) -> TierResult<Vec<StatData>>;
}

// ----------------------------------------------------------------------------
// 10.2 In-Memory Tiers
// ----------------------------------------------------------------------------

/// How a tier maps a query onto its buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierLookup {
    /// Only the bucket keyed by the query start
    ExactKey,
    /// Every bucket of the stream whose start lies in `[start, end]`
    StartRange,
}

/// Cache tier holding buckets keyed by `StatQuery::cache_key`.
#[derive(Debug)]
pub struct MemoryStatTier {
    name: String,
    lookup: TierLookup,
    buckets: DashMap<String, Vec<StatData>>,
}

impl MemoryStatTier {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), lookup: TierLookup::ExactKey, buckets: DashMap::new() }
    }

    /// Tier answering range queries, as the day tier does.
    pub fn ranged(name: impl Into<String>) -> Self {
        Self { name: name.into(), lookup: TierLookup::StartRange, buckets: DashMap::new() }
    }

    pub fn lookup(&self) -> TierLookup {
        self.lookup
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert(&self, cache_key: impl Into<String>, records: Vec<StatData>) {
        self.buckets.insert(cache_key.into(), records);
    }

    pub fn remove(&self, cache_key: &str) -> Option<Vec<StatData>> {
        self.buckets.remove(cache_key).map(|(_, records)| records)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[async_trait]
impl StatTier for MemoryStatTier {
    async fn get_data(&self, query: &StatQuery) -> TierResult<Vec<StatData>> {
        match self.lookup {
            TierLookup::ExactKey => Ok(self
                .buckets
                .get(&query.cache_key())
                .map(|entry| entry.value().clone())
                .unwrap_or_default()),
            TierLookup::StartRange => {
                let suffix = build_cache_key("", &query.group_id, &query.stream_id, &query.metric_id);
                let mut hits: Vec<(String, Vec<StatData>)> = self
                    .buckets
                    .iter()
                    .filter_map(|entry| {
                        let start = entry.key().strip_suffix(suffix.as_str())?;
                        let in_range = start >= query.start.as_str() && start <= query.end.as_str();
                        in_range.then(|| (start.to_string(), entry.value().clone()))
                    })
                    .collect();
                hits.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(hits.into_iter().flat_map(|(_, records)| records).collect())
            }
        }
    }
}

/// Real-time path answering from a flat in-memory record set.
#[derive(Debug, Default)]
pub struct MemoryRealTimeQuery {
    records: RwLock<Vec<StatData>>,
}

impl MemoryRealTimeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: StatData) {
        self.records.write().push(record);
    }

    pub fn extend(&self, records: impl IntoIterator<Item = StatData>) {
        self.records.write().extend(records);
    }

    fn select(&self, predicate: impl Fn(&StatData) -> bool) -> Vec<StatData> {
        self.records.read().iter().filter(|r| predicate(r)).cloned().collect()
    }
}

fn in_range(record: &StatData, start: &str, end: &str) -> bool {
    record.log_ts.as_str() >= start && record.log_ts.as_str() <= end
}

fn tag_matches(record: &StatData, tag: &str) -> bool {
    tag == DEFAULT_AUDIT_TAG || record.tag == tag
}

fn same_stream(record: &StatData, query: &StatQuery) -> bool {
    record.group_id == query.group_id
        && record.stream_id == query.stream_id
        && record.metric_id == query.metric_id
        && tag_matches(record, &query.tag)
        && in_range(record, &query.start, &query.end)
}

#[async_trait]
impl RealTimeQuery for MemoryRealTimeQuery {
    async fn query_log_ts(&self, query: &StatQuery) -> TierResult<Vec<StatData>> {
        Ok(self.select(|r| same_stream(r, query)))
    }

    async fn query_ids_by_ip(&self, query: &IpQuery) -> TierResult<Vec<StatData>> {
        Ok(self.select(|r| {
            r.ip.as_deref() == Some(query.ip.as_str())
                && r.metric_id == query.metric_id
                && tag_matches(r, &query.tag)
                && in_range(r, &query.start, &query.end)
        }))
    }

    async fn query_report_ips(&self, query: &StatQuery) -> TierResult<Vec<StatData>> {
        Ok(self.select(|r| r.ip.is_some() && same_stream(r, query)))
    }
}

// ----------------------------------------------------------------------------
// 10.3 Tier Set
// ----------------------------------------------------------------------------

/// Every collaborator the gateway routes to.
#[derive(Clone)]
pub struct TierSet {
    pub day: Arc<dyn StatTier>,
    pub hour: Arc<dyn StatTier>,
    pub ten_minutes: Arc<dyn StatTier>,
    pub half_hour: Arc<dyn StatTier>,
    pub real_time: Arc<dyn RealTimeQuery>,
}

impl Debug for TierSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TierSet").finish_non_exhaustive()
    }
}

impl TierSet {
    pub fn in_memory() -> Self {
        Self {
            day: Arc::new(MemoryStatTier::ranged("day")),
            hour: Arc::new(MemoryStatTier::new("hour")),
            ten_minutes: Arc::new(MemoryStatTier::new("ten_minutes")),
            half_hour: Arc::new(MemoryStatTier::new("half_hour")),
            real_time: Arc::new(MemoryRealTimeQuery::new()),
        }
    }
}

// ============================================================================
// SECTION 11: QUERY GATEWAY
// ============================================================================
// Stateless HTTP front end over the statistic tiers:
// - One token bucket per endpoint; excess requests wait for a token
// - Required parameters validated before any tier is touched
// - Closed dispatch over endpoint and cycle with an explicit unknown arm
// - Every outcome is a JSON envelope written with the configured status
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Query Parameters
// ----------------------------------------------------------------------------

/// Decoded query-string parameters; the last value wins on duplicate keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    values: HashMap<String, String>,
}

impl QueryParams {
    /// Parse a raw query string. Pairs that do not contain exactly one `=`
    /// or have an empty value are dropped. A missing tag gets the default.
    ///
    /// Percent escapes are decoded but a literal `+` is kept as is, so
    /// timestamps such as `2024-01-01+08` reach the tiers unchanged.
    pub fn parse(raw: Option<&str>) -> Self {
        let mut values = HashMap::new();

        for pair in raw.unwrap_or_default().split('&') {
            if pair.matches('=').count() != 1 {
                continue;
            }
            let pair = pair.replace('+', "%2B");
            if let Some((key, value)) = form_urlencoded::parse(pair.as_bytes()).next() {
                if value.is_empty() {
                    continue;
                }
                values.insert(key.into_owned(), value.into_owned());
            }
        }

        values
            .entry(PARAM_TAG.to_string())
            .or_insert_with(|| DEFAULT_AUDIT_TAG.to_string());
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Names from `required` that are absent.
    pub fn missing(&self, required: &[&'static str]) -> Vec<&'static str> {
        required.iter().copied().filter(|name| !self.values.contains_key(*name)).collect()
    }

    fn value(&self, key: &str) -> String {
        self.get(key).unwrap_or_default().to_string()
    }

    fn stat_query(&self) -> StatQuery {
        StatQuery {
            start: self.value(PARAM_START),
            end: self.value(PARAM_END),
            metric_id: self.value(PARAM_METRIC_ID),
            group_id: self.value(PARAM_GROUP_ID),
            stream_id: self.value(PARAM_STREAM_ID),
            tag: self.value(PARAM_TAG),
        }
    }

    fn ip_query(&self) -> IpQuery {
        IpQuery {
            start: self.value(PARAM_START),
            end: self.value(PARAM_END),
            metric_id: self.value(PARAM_METRIC_ID),
            ip: self.value(PARAM_IP),
            tag: self.value(PARAM_TAG),
        }
    }
}

// ----------------------------------------------------------------------------
// 11.2 Request Context
// ----------------------------------------------------------------------------

/// Typed query derived from validated parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatedQuery {
    ByDay(StatQuery),
    ByHour(StatQuery),
    ByMinute { query: StatQuery, cycle: String },
    IdsByIp(IpQuery),
    IpsByStream(StatQuery),
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub endpoint: EndpointType,
    pub params: QueryParams,
    pub query: ValidatedQuery,
}

impl RequestContext {
    /// Validate `params` for `endpoint`.
    pub fn build(endpoint: EndpointType, params: QueryParams) -> GatewayResult<Self> {
        let missing = params.missing(endpoint.required_params());
        if !missing.is_empty() {
            return Err(GatewayError::InvalidParams { missing });
        }

        let query = match endpoint {
            EndpointType::ByDay => ValidatedQuery::ByDay(params.stat_query()),
            EndpointType::ByHour => ValidatedQuery::ByHour(params.stat_query()),
            EndpointType::ByMinuteGranularity => ValidatedQuery::ByMinute {
                query: params.stat_query(),
                cycle: params.value(PARAM_CYCLE),
            },
            EndpointType::LookupIdsByIp => ValidatedQuery::IdsByIp(params.ip_query()),
            EndpointType::LookupIpsByStream => ValidatedQuery::IpsByStream(params.stat_query()),
        };

        Ok(Self { endpoint, params, query })
    }
}

// ----------------------------------------------------------------------------
// 11.3 Endpoint Rate Limiters
// ----------------------------------------------------------------------------

/// One token bucket per endpoint.
pub struct EndpointLimiters {
    qps: u32,
    limiters: HashMap<EndpointType, DefaultDirectRateLimiter>,
}

impl Debug for EndpointLimiters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointLimiters").field("qps", &self.qps).finish()
    }
}

impl EndpointLimiters {
    pub fn new(qps: u32) -> Self {
        let rate = NonZeroU32::new(qps).unwrap_or(NonZeroU32::MIN);
        let limiters = EndpointType::ALL
            .iter()
            .map(|endpoint| (*endpoint, RateLimiter::direct(Quota::per_second(rate))))
            .collect();
        Self { qps: rate.get(), limiters }
    }

    /// Wait until `endpoint` has a token available.
    pub async fn acquire(&self, endpoint: EndpointType) {
        if let Some(limiter) = self.limiters.get(&endpoint) {
            limiter.until_ready().await;
        }
    }

    /// Take a token without waiting.
    pub fn try_acquire(&self, endpoint: EndpointType) -> bool {
        self.limiters
            .get(&endpoint)
            .map(|limiter| limiter.check().is_ok())
            .unwrap_or(true)
    }
}

// ----------------------------------------------------------------------------
// 11.4 Gateway Metrics
// ----------------------------------------------------------------------------

pub struct GatewayMetrics {
    registry: PrometheusRegistry,
    requests: IntCounterVec,
    latency: HistogramVec,
}

impl Debug for GatewayMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayMetrics").finish_non_exhaustive()
    }
}

impl GatewayMetrics {
    pub fn new() -> GatewayResult<Self> {
        let registry = PrometheusRegistry::new();
        let requests = IntCounterVec::new(
            Opts::new("audit_gateway_requests_total", "Gateway requests by endpoint and outcome"),
            &["endpoint", "outcome"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new("audit_gateway_request_duration_seconds", "Gateway request latency"),
            &["endpoint"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        Ok(Self { registry, requests, latency })
    }

    pub fn observe(&self, endpoint: EndpointType, outcome: &str, elapsed: Duration) {
        self.requests.with_label_values(&[endpoint.as_str(), outcome]).inc();
        self.latency.with_label_values(&[endpoint.as_str()]).observe(elapsed.as_secs_f64());
    }

    pub fn request_count(&self, endpoint: EndpointType, outcome: &str) -> u64 {
        self.requests.with_label_values(&[endpoint.as_str(), outcome]).get()
    }

    /// Prometheus text exposition of all gateway metrics.
    pub fn render(&self) -> GatewayResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

// ----------------------------------------------------------------------------
// 11.5 Query Gateway
// ----------------------------------------------------------------------------

/// Validates, rate-limits and routes statistics queries.
#[derive(Debug)]
pub struct QueryGateway {
    api: ApiConfig,
    tiers: TierSet,
    limiters: EndpointLimiters,
    metrics: GatewayMetrics,
}

impl QueryGateway {
    pub fn new(api: ApiConfig, tiers: TierSet) -> GatewayResult<Self> {
        let limiters = EndpointLimiters::new(api.limiter_qps);
        let metrics = GatewayMetrics::new()?;
        Ok(Self { api, tiers, limiters, metrics })
    }

    pub fn api(&self) -> &ApiConfig {
        &self.api
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Serve one request. Never fails: every outcome, including a tier error
    /// or panic, becomes an envelope.
    pub async fn handle(&self, endpoint: EndpointType, uri: &Uri) -> ApiResponse {
        self.limiters.acquire(endpoint).await;

        let started = Instant::now();
        let request_uri = uri.to_string();
        let outcome = AssertUnwindSafe(self.process(endpoint, uri.query(), &request_uri))
            .catch_unwind()
            .await;

        let (response, label) = match outcome {
            Ok(Ok(response)) => {
                let label = if response.success { "success" } else { "invalid" };
                (response, label)
            }
            Ok(Err(e)) => {
                error!(
                    target: "audit::gateway",
                    endpoint = %endpoint,
                    uri = %request_uri,
                    error = %e,
                    "Query failed"
                );
                (ApiResponse::query_failed(&request_uri), "error")
            }
            Err(_) => {
                error!(target: "audit::gateway", endpoint = %endpoint, uri = %request_uri, "Query handler panicked");
                (ApiResponse::query_failed(&request_uri), "panic")
            }
        };

        self.metrics.observe(endpoint, label, started.elapsed());
        response
    }

    async fn process(
        &self,
        endpoint: EndpointType,
        raw_query: Option<&str>,
        request_uri: &str,
    ) -> TierResult<ApiResponse> {
        let params = QueryParams::parse(raw_query);
        let context = match RequestContext::build(endpoint, params) {
            Ok(context) => context,
            Err(e) => {
                warn!(target: "audit::gateway", endpoint = %endpoint, uri = %request_uri, error = %e, "Rejected request");
                return Ok(ApiResponse::invalid_params(request_uri));
            }
        };

        let data = self.route(&context.query).await?;
        debug!(target: "audit::gateway", endpoint = %endpoint, records = data.len(), "Query served");
        Ok(ApiResponse::success(data))
    }

    async fn route(&self, query: &ValidatedQuery) -> TierResult<Vec<StatData>> {
        match query {
            ValidatedQuery::ByHour(q) => self.tiers.hour.get_data(q).await,
            ValidatedQuery::ByDay(q) => self.tiers.day.get_data(q).await,
            ValidatedQuery::IdsByIp(q) => self.tiers.real_time.query_ids_by_ip(q).await,
            ValidatedQuery::IpsByStream(q) => self.tiers.real_time.query_report_ips(q).await,
            ValidatedQuery::ByMinute { query: q, cycle } => match AuditCycle::from_param(cycle) {
                Some(AuditCycle::Minute) => self.tiers.real_time.query_log_ts(q).await,
                Some(AuditCycle::Minute10) => self.tiers.ten_minutes.get_data(q).await,
                Some(AuditCycle::Minute30) => self.tiers.half_hour.get_data(q).await,
                _ => {
                    error!(target: "audit::gateway", cycle = %cycle, "Unsupported cycle");
                    Ok(Vec::new())
                }
            },
        }
    }

    /// Serialize an envelope with the configured status and content type.
    pub fn render(&self, envelope: &ApiResponse) -> Response {
        let status = self.api.status_code();
        match serde_json::to_vec(envelope) {
            Ok(body) => (status, [(header::CONTENT_TYPE, CONTENT_TYPE_JSON)], body).into_response(),
            Err(e) => {
                error!(target: "audit::gateway", error = %e, "Failed to serialize response");
                status.into_response()
            }
        }
    }

    async fn respond(&self, endpoint: EndpointType, uri: Uri) -> Response {
        let envelope = self.handle(endpoint, &uri).await;
        self.render(&envelope)
    }

    fn metrics_response(&self) -> Response {
        match self.metrics.render() {
            Ok(text) => (StatusCode::OK, [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], text).into_response(),
            Err(e) => {
                error!(target: "audit::gateway", error = %e, "Failed to render metrics");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }

    /// Router with the five query endpoints and the metrics endpoint.
    pub fn router(self: &Arc<Self>) -> Router {
        let mut router: Router<Arc<QueryGateway>> = Router::new();
        for endpoint in EndpointType::ALL {
            router = router.route(
                self.api.path_for(endpoint),
                get(move |State(gateway): State<Arc<QueryGateway>>, uri: Uri| async move {
                    gateway.respond(endpoint, uri).await
                }),
            );
        }

        router
            .route(
                &self.api.metrics_path,
                get(|State(gateway): State<Arc<QueryGateway>>| async move { gateway.metrics_response() }),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(self))
    }
}

/// Bind the API listener with the configured accept backlog.
pub fn bind_listener(api: &ApiConfig) -> GatewayResult<TokioTcpListener> {
    let addr = api.socket_addr().map_err(|e| GatewayError::Bind {
        addr: format!("{}:{}", api.bind_address, api.bind_port),
        message: e.to_string(),
    })?;
    let bind_error = |e: std::io::Error| GatewayError::Bind { addr: addr.to_string(), message: e.to_string() };

    let socket = (if addr.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() }).map_err(bind_error)?;
    socket.set_reuseaddr(true).map_err(bind_error)?;
    socket.bind(addr).map_err(bind_error)?;
    socket.listen(api.backlog).map_err(bind_error)
}

// ============================================================================
// SECTION 12: SERVICE CONTEXT & LIFECYCLE
// ============================================================================
// `AuditService` owns every component. Collaborators receive what they need
// from it instead of reaching for process-wide globals, so each test can
// build a fresh, isolated instance.
// ============================================================================

/// The single owning context of the audit control plane.
pub struct AuditService {
    config: ServiceConfig,
    store: Option<Arc<dyn ConfigStore>>,
    config_sync: OnceCell<Arc<ConfigSyncEngine>>,
    discovery: Arc<DiscoveryClient>,
    gateway: Arc<QueryGateway>,
    shutdown: CancellationToken,
    running: AtomicBool,
    start_time: Instant,
}

impl Debug for AuditService {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditService")
            .field("config_sync", &self.config_sync.get())
            .field("discovery", &self.discovery)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl AuditService {
    pub fn new(config: ServiceConfig, tiers: TierSet) -> AuditResult<Self> {
        config.validate()?;
        let discovery = Arc::new(DiscoveryClient::from_config(&config.discovery));
        let gateway = Arc::new(QueryGateway::new(config.api.clone(), tiers)?);

        Ok(Self {
            config,
            store: None,
            config_sync: OnceCell::new(),
            discovery,
            gateway,
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
            start_time: Instant::now(),
        })
    }

    /// Use `store` instead of the SQL store built from configuration.
    pub fn with_config_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The config sync engine, built on first access. Concurrent first
    /// callers all receive the same instance.
    pub fn config_sync(&self) -> AuditResult<Arc<ConfigSyncEngine>> {
        self.config_sync
            .get_or_try_init(|| {
                let store: Arc<dyn ConfigStore> = match &self.store {
                    Some(store) => Arc::clone(store),
                    None => Arc::new(SqlConfigStore::new(self.config.store.clone())?),
                };
                Ok::<_, AuditError>(Arc::new(ConfigSyncEngine::new(store, &self.config.config_sync)))
            })
            .map(Arc::clone)
    }

    pub fn discovery(&self) -> &Arc<DiscoveryClient> {
        &self.discovery
    }

    pub fn gateway(&self) -> &Arc<QueryGateway> {
        &self.gateway
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Start the refresh loops and return the HTTP router.
    pub async fn init(&self) -> AuditResult<Router> {
        let sync = self.config_sync()?;
        sync.start();

        let seeds = self.config.discovery.static_address_set();
        if !seeds.is_empty() {
            let count = seeds.len();
            if self.discovery.set_addresses(seeds) {
                info!(target: "audit::engine", count, "Seeded collector addresses from configuration");
            }
        }

        if let Some(manager_host) = &self.config.discovery.manager_host {
            self.discovery
                .configure(self.config.discovery.component, manager_host, self.config.discovery.auth())
                .await?;
        }

        self.router()
    }

    /// Gateway routes plus the health route.
    pub fn router(&self) -> AuditResult<Router> {
        let sync = self.config_sync()?;
        let discovery = Arc::clone(&self.discovery);
        let started = self.start_time;

        let health = get(move || {
            let report = health_report(&sync, &discovery, started.elapsed());
            async move { axum::Json(report) }
        });

        Ok(self.gateway.router().route(&self.config.api.health_path, health))
    }

    /// Run until a termination signal or `trigger_shutdown`.
    pub async fn run(&self) -> AuditResult<()> {
        info!(target: "audit::engine", version = SERVICE_VERSION, "Starting audit service");

        let router = self.init().await?;
        let listener = bind_listener(&self.config.api)?;
        self.running.store(true, AtomicOrdering::Release);

        info!(
            target: "audit::engine",
            addr = %listener.local_addr()?,
            backlog = self.config.api.backlog,
            workers = self.config.api.pool_size,
            qps = self.config.api.limiter_qps,
            "Query gateway listening"
        );

        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_signal() => token.cancel(),
                _ = token.cancelled() => {}
            }
        });

        let token = self.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;

        self.shutdown().await;
        Ok(())
    }

    /// Ask a running service to stop.
    pub fn trigger_shutdown(&self) {
        info!(target: "audit::engine", "Shutdown requested");
        self.shutdown.cancel();
    }

    /// Stop refresh loops and release the store.
    pub async fn shutdown(&self) {
        let shutdown_start = Instant::now();
        self.shutdown.cancel();

        if let Some(sync) = self.config_sync.get() {
            sync.shutdown().await;
        }
        self.discovery.shutdown().await;
        self.running.store(false, AtomicOrdering::Release);

        info!(
            target: "audit::engine",
            duration_ms = shutdown_start.elapsed().as_millis() as u64,
            uptime_secs = self.uptime().as_secs(),
            "Audit service shutdown complete"
        );
    }
}

/// Health document served on the health route.
pub fn health_report(sync: &ConfigSyncEngine, discovery: &DiscoveryClient, uptime: Duration) -> JsonValue {
    let sync_health = sync.health();
    let discovery_health = discovery.health();
    let stale = sync_health.status == RefreshStatus::Stale || discovery_health.status == RefreshStatus::Stale;

    json!({
        "status": if stale { "DEGRADED" } else { "UP" },
        "version": SERVICE_VERSION,
        "uptime_secs": uptime.as_secs(),
        "config_sync": {
            "health": sync_health,
            "metric_ids": sync.metric_identifiers().len(),
            "services": sync.directory().len(),
        },
        "discovery": {
            "health": discovery_health,
            "addresses": discovery.addresses().len(),
            "endpoint": discovery.endpoint_url(),
        },
    })
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(target: "audit::engine", error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(target: "audit::engine", error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(target: "audit::engine", "Received SIGINT"),
        _ = terminate => info!(target: "audit::engine", "Received SIGTERM"),
    }
}

// ============================================================================
// SECTION 13: CLI & COMMAND LINE INTERFACE
// ============================================================================

/// Audit service CLI
#[derive(Parser, Debug)]
#[command(
    name = "audit-service",
    version,
    about = "Control plane of the audit metrics service",
    long_about = "Keeps metric identifiers, data sources and collector addresses fresh, \
                  and serves rate-limited statistics queries over HTTP."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "AUDIT_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "AUDIT_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long, env = "AUDIT_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the service (default)
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Pull collector addresses once and print a random selection
    Discover,

    /// Show version information
    Version,
}

fn handle_validate(config_path: &Path, verbose: bool) -> AuditResult<()> {
    println!("🔍 Validating configuration: {}", config_path.display());

    match ServiceConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                println!("{:#?}", config);
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Store: {}", config.store.connection_url());
            println!("  • Config refresh: every {}s", config.config_sync.update_interval_secs);
            match &config.discovery.manager_host {
                Some(host) => println!(
                    "  • Discovery: {} (auto refresh: {})",
                    host, config.discovery.auto_refresh
                ),
                None => println!("  • Discovery: disabled"),
            }
            println!(
                "  • Gateway: {}:{} ({} workers, {} qps per endpoint)",
                config.api.bind_address, config.api.bind_port, config.api.pool_size, config.api.limiter_qps
            );
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(AuditError::Config(e))
        }
    }
}

fn handle_generate_config(output: Option<&Path>) -> AuditResult<()> {
    let config_str = ServiceConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

fn handle_version() {
    println!("📈 {} v{}", SERVICE_FULL_NAME, SERVICE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
}

async fn handle_discover(config: &ServiceConfig) -> AuditResult<()> {
    let Some(manager_host) = &config.discovery.manager_host else {
        println!("❌ discovery.manager_host is not set");
        return Err(ConfigError::missing_field("discovery.manager_host").into());
    };

    let mut settings = DiscoverySettings::from(&config.discovery);
    settings.auto_refresh = false;
    let client = Arc::new(DiscoveryClient::new(settings));
    client.configure(config.discovery.component, manager_host, config.discovery.auth()).await?;

    let health = client.health();
    if let Some(message) = &health.last_error_message {
        println!("⚠️  Pull failed: {}", message);
    }

    let addresses = client.addresses();
    println!("📡 {} collector address(es):", addresses.len());
    for address in addresses.iter() {
        println!("  • {}", address);
    }
    match client.select_address() {
        Some(address) => println!("🎯 Selected: {}", address),
        None => println!("🎯 Selected: none"),
    }

    client.shutdown().await;
    Ok(())
}

// ============================================================================
// SECTION 14: MAIN ENTRY POINT
// ============================================================================

fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        ServiceConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        ServiceConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if !config_found {
        warn!(target: "audit::init", path = %cli.config.display(), "Config file not found, using defaults");
    }
    info!("📈 {} v{}", SERVICE_FULL_NAME, SERVICE_VERSION);

    let runtime = RuntimeBuilder::new_multi_thread()
        .worker_threads(config.api.pool_size)
        .thread_name("audit-worker")
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Some(Commands::Discover) => handle_discover(&config).await?,
            _ => {
                let service = AuditService::new(config, TierSet::in_memory())?;
                service.run().await?;
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}

// ============================================================================
// SECTION 15: TESTS
// ============================================================================


#[cfg(test)]
mod config_sync_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn source_row(service: &str, url: &str) -> DataSourceRow {
        DataSourceRow {
            service_id: service.to_string(),
            config: DataSourceConfig::new("driver", url, "user", "pass"),
        }
    }

    fn engine(store: MockConfigStore) -> ConfigSyncEngine {
        ConfigSyncEngine::new(Arc::new(store), &ConfigSyncConfig::default())
    }

    #[tokio::test]
    async fn test_metric_ids_never_regress_to_empty() {
        let mut store = MockConfigStore::new();
        store.expect_is_closed().return_const(false);
        let mut calls = 0;
        store.expect_fetch_metric_ids().returning(move || {
            calls += 1;
            match calls {
                1 => Ok(ids(&["1", "2"])),
                2 => Err(StoreError::Query { message: "connection reset".into() }),
                _ => Ok(Vec::new()),
            }
        });
        let engine = engine(store);

        assert!(engine.metric_identifiers().is_empty());
        assert_eq!(engine.refresh_metric_ids().await.unwrap(), RefreshOutcome::Published(2));
        let published = engine.metric_identifiers();

        assert!(engine.refresh_metric_ids().await.is_err());
        assert_eq!(*engine.metric_identifiers(), *published);

        assert_eq!(engine.refresh_metric_ids().await.unwrap(), RefreshOutcome::Retained);
        assert_eq!(*engine.metric_identifiers(), ids(&["1", "2"]));
        assert!(engine.contains_metric("2"));
        assert!(!engine.contains_metric("3"));
    }

    #[tokio::test]
    async fn test_data_sources_never_regress_to_empty() {
        let mut store = MockConfigStore::new();
        store.expect_is_closed().return_const(false);
        let mut calls = 0;
        store.expect_fetch_data_sources().returning(move || {
            calls += 1;
            match calls {
                1 => Ok(vec![source_row("svc-a", "u1"), source_row("svc-a", "u2"), source_row("svc-b", "u3")]),
                2 => Ok(Vec::new()),
                _ => Err(StoreError::Closed),
            }
        });
        let engine = engine(store);

        assert_eq!(engine.refresh_data_sources().await.unwrap(), RefreshOutcome::Published(2));
        let before = engine.directory();

        assert_eq!(engine.refresh_data_sources().await.unwrap(), RefreshOutcome::Retained);
        assert!(engine.refresh_data_sources().await.is_err());

        assert_eq!(*engine.directory(), *before);
        assert_eq!(engine.all_data_sources().len(), 3);
        assert_eq!(engine.data_sources_by_service("svc-a").unwrap().len(), 2);
        assert!(engine.data_sources_by_service("svc-x").is_none());
    }

    #[tokio::test]
    async fn test_closed_store_is_rebuilt_before_query() {
        let mut store = MockConfigStore::new();
        store.expect_is_closed().times(1).return_const(true);
        store.expect_reconnect().times(1).returning(|| Ok(()));
        store.expect_fetch_metric_ids().times(1).returning(|| Ok(ids(&["7"])));
        let engine = engine(store);

        assert!(engine.refresh_metric_ids().await.unwrap().is_published());
        assert_eq!(*engine.metric_identifiers(), ids(&["7"]));
    }

    #[tokio::test]
    async fn test_failed_reconnect_skips_cycle() {
        let mut store = MockConfigStore::new();
        store.expect_is_closed().return_const(true);
        store
            .expect_reconnect()
            .returning(|| Err(StoreError::Connect { message: "refused".into() }));
        store.expect_fetch_metric_ids().times(0);
        store.expect_fetch_data_sources().times(0);
        let engine = engine(store);

        assert!(!engine.refresh_once().await);
        let health = engine.health();
        assert_eq!(health.status, RefreshStatus::Degraded);
        assert_eq!(health.consecutive_failures, 1);
        assert!(engine.metric_identifiers().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_once_runs_both_refreshes() {
        let mut store = MockConfigStore::new();
        store.expect_is_closed().return_const(false);
        store.expect_fetch_metric_ids().times(1).returning(|| Err(StoreError::Closed));
        store
            .expect_fetch_data_sources()
            .times(1)
            .returning(|| Ok(vec![source_row("svc", "u")]));
        let engine = engine(store);

        assert!(!engine.refresh_once().await);
        assert_eq!(engine.all_data_sources().len(), 1);
        assert_eq!(engine.health().failures, 1);
    }

    #[tokio::test]
    async fn test_start_refreshes_immediately_and_shutdown_closes_store() {
        let mut store = MockConfigStore::new();
        store.expect_is_closed().return_const(false);
        store.expect_fetch_metric_ids().returning(|| Ok(ids(&["1"])));
        store.expect_fetch_data_sources().returning(|| Ok(vec![source_row("svc", "u")]));
        store.expect_close().times(1).return_const(());
        let engine = Arc::new(engine(store));

        assert!(engine.start());
        assert!(!engine.start());

        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.health().status == RefreshStatus::Unknown && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(engine.health().status, RefreshStatus::Healthy);
        assert_eq!(*engine.metric_identifiers(), ids(&["1"]));
        assert!(engine.is_running());

        engine.shutdown().await;
        assert!(!engine.is_running());
    }

    fn counting_job(counter: &Arc<AtomicU64>, stop_after: u64) -> impl FnMut() -> futures::future::Ready<bool> {
        let counter = Arc::clone(counter);
        move || {
            let runs = counter.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            futures::future::ready(runs < stop_after)
        }
    }

    #[tokio::test]
    async fn test_periodic_task_ends_when_job_declines() {
        let runs = Arc::new(AtomicU64::new(0));
        let task = PeriodicTask::spawn_fixed_delay(
            "test",
            Duration::ZERO,
            Duration::from_millis(10),
            counting_job(&runs, 3),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while !task.is_finished() && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }

        assert!(task.is_finished());
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dropped_periodic_task_stops_running() {
        let runs = Arc::new(AtomicU64::new(0));
        let task = PeriodicTask::spawn_fixed_delay(
            "test",
            Duration::ZERO,
            Duration::from_millis(10),
            counting_job(&runs, u64::MAX),
        );
        sleep(Duration::from_millis(50)).await;
        drop(task);
        sleep(Duration::from_millis(30)).await;

        let after_drop = runs.load(AtomicOrdering::SeqCst);
        sleep(Duration::from_millis(100)).await;
        assert!(after_drop > 0);
        assert_eq!(runs.load(AtomicOrdering::SeqCst), after_drop);
    }

    #[tokio::test]
    async fn test_refresh_repeats_on_fixed_delay() {
        let mut store = MockConfigStore::new();
        store.expect_is_closed().return_const(false);
        store.expect_fetch_metric_ids().returning(|| Ok(ids(&["1"])));
        store.expect_fetch_data_sources().returning(|| Ok(vec![source_row("svc", "u")]));
        store.expect_close().return_const(());
        let engine = Arc::new(ConfigSyncEngine::new(
            Arc::new(store),
            &ConfigSyncConfig { update_interval_secs: 1 },
        ));

        engine.start();
        let deadline = Instant::now() + Duration::from_secs(4);
        while engine.health().cycles < 2 && Instant::now() < deadline {
            sleep(Duration::from_millis(20)).await;
        }

        assert!(engine.health().cycles >= 2);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_engine_ends_its_timer() {
        let fetches = Arc::new(AtomicU64::new(0));
        let mut store = MockConfigStore::new();
        store.expect_is_closed().return_const(false);
        let counter = Arc::clone(&fetches);
        store.expect_fetch_metric_ids().returning(move || {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(ids(&["1"]))
        });
        store.expect_fetch_data_sources().returning(|| Ok(Vec::new()));
        let engine = Arc::new(ConfigSyncEngine::new(
            Arc::new(store),
            &ConfigSyncConfig { update_interval_secs: 1 },
        ));

        engine.start();
        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.health().cycles == 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }
        drop(engine);

        let after_drop = fetches.load(AtomicOrdering::SeqCst);
        sleep(Duration::from_millis(2_500)).await;
        assert_eq!(after_drop, 1);
        assert_eq!(fetches.load(AtomicOrdering::SeqCst), after_drop);
    }

    #[tokio::test]
    async fn test_sql_store_rejects_bad_url() {
        let config = StoreConfig { url: "not a url".into(), ..StoreConfig::default() };
        assert!(SqlConfigStore::new(config).is_err());
    }
}


#[cfg(test)]
mod gateway_tests {
    use super::*;
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tower::ServiceExt;

    const HOUR_QUERY: &str = "start=2024-01-01T00&end=2024-01-01T01&metricId=5&groupId=g1&streamId=s1";

    fn record(log_ts: &str, count: i64) -> StatData {
        StatData {
            log_ts: log_ts.into(),
            group_id: "g1".into(),
            stream_id: "s1".into(),
            metric_id: "5".into(),
            tag: DEFAULT_AUDIT_TAG.into(),
            count,
            size: count * 100,
            delay: 3,
            ..StatData::default()
        }
    }

    /// Tiers that fail the request if any of them is called.
    fn untouched_tiers() -> TierSet {
        TierSet {
            day: Arc::new(MockStatTier::new()),
            hour: Arc::new(MockStatTier::new()),
            ten_minutes: Arc::new(MockStatTier::new()),
            half_hour: Arc::new(MockStatTier::new()),
            real_time: Arc::new(MockRealTimeQuery::new()),
        }
    }

    fn gateway(tiers: TierSet) -> QueryGateway {
        QueryGateway::new(ApiConfig::default(), tiers).unwrap()
    }

    fn uri(path: &str, query: &str) -> Uri {
        format!("{}?{}", path, query).parse().unwrap()
    }

    fn full_query(endpoint: EndpointType) -> Vec<(&'static str, &'static str)> {
        endpoint
            .required_params()
            .iter()
            .map(|name| {
                let value = match *name {
                    PARAM_CYCLE => "1",
                    PARAM_IP => "10.0.0.1",
                    _ => "v",
                };
                (*name, value)
            })
            .collect()
    }

    fn encode(pairs: &[(&str, &str)]) -> String {
        pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join("&")
    }

    async fn body_json(response: Response) -> JsonValue {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_parse_drops_malformed_pairs() {
        let params = QueryParams::parse(Some("start=1&flag&a=b=c&=x&end=&groupId=g%201&groupId=g2"));
        assert_eq!(params.get(PARAM_START), Some("1"));
        assert_eq!(params.get("flag"), None);
        assert_eq!(params.get("a"), None);
        assert_eq!(params.get(PARAM_END), None);
        assert_eq!(params.get(PARAM_GROUP_ID), Some("g2"));
        assert_eq!(params.get(PARAM_TAG), Some(DEFAULT_AUDIT_TAG));
    }

    #[test]
    fn test_parse_decodes_and_keeps_explicit_tag() {
        let params = QueryParams::parse(Some("streamId=s%201&tag=blue"));
        assert_eq!(params.get(PARAM_STREAM_ID), Some("s 1"));
        assert_eq!(params.get(PARAM_TAG), Some("blue"));

        let empty = QueryParams::parse(None);
        assert_eq!(empty.len(), 1);
        assert_eq!(empty.get(PARAM_TAG), Some(DEFAULT_AUDIT_TAG));
    }

    #[test]
    fn test_parse_keeps_literal_plus() {
        let params = QueryParams::parse(Some("start=2024-01-01+08&groupId=a%2Bb&streamId=s%201"));
        assert_eq!(params.get(PARAM_START), Some("2024-01-01+08"));
        assert_eq!(params.get(PARAM_GROUP_ID), Some("a+b"));
        assert_eq!(params.get(PARAM_STREAM_ID), Some("s 1"));
    }

    #[rstest]
    #[case(EndpointType::ByDay)]
    #[case(EndpointType::ByHour)]
    #[case(EndpointType::ByMinuteGranularity)]
    #[case(EndpointType::LookupIdsByIp)]
    #[case(EndpointType::LookupIpsByStream)]
    #[tokio::test]
    async fn test_required_params_gate_routing(#[case] endpoint: EndpointType) {
        let gateway = gateway(TierSet::in_memory());
        let path = ApiConfig::default().path_for(endpoint).to_string();
        let pairs = full_query(endpoint);

        let complete = gateway.handle(endpoint, &uri(&path, &encode(&pairs))).await;
        assert_eq!(complete, ApiResponse::success(Vec::new()));

        for skip in 0..pairs.len() {
            let partial: Vec<_> = pairs.iter().enumerate().filter(|(i, _)| *i != skip).map(|(_, p)| *p).collect();
            let response = gateway.handle(endpoint, &uri(&path, &encode(&partial))).await;
            assert!(!response.success, "missing {} accepted", pairs[skip].0);
            assert!(response.err_msg.starts_with(INVALID_PARAMS_MESSAGE));
            assert!(response.data.is_empty());
        }
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_tiers() {
        let gateway = gateway(untouched_tiers());
        let response = gateway.handle(EndpointType::ByDay, &uri(DEFAULT_DAY_PATH, "start=1")).await;
        assert_eq!(response, ApiResponse::invalid_params("/audit/query/day?start=1"));
    }

    #[tokio::test]
    async fn test_exact_minute_uses_real_time_path() {
        let mut real_time = MockRealTimeQuery::new();
        real_time
            .expect_query_log_ts()
            .times(1)
            .withf(|q| q.group_id == "g1" && q.stream_id == "s1" && q.metric_id == "5")
            .returning(|_| Ok(vec![record("2024-01-01 00:01:00", 10)]));
        let tiers = TierSet { real_time: Arc::new(real_time), ..untouched_tiers() };

        let query = format!("{}&cycle=1", HOUR_QUERY);
        let response = gateway(tiers).handle(EndpointType::ByMinuteGranularity, &uri(DEFAULT_MINUTES_PATH, &query)).await;

        assert!(response.success);
        assert_eq!(response.data, vec![record("2024-01-01 00:01:00", 10)]);
    }

    #[rstest]
    #[case("10")]
    #[case("30")]
    #[tokio::test]
    async fn test_cycle_routes_to_matching_cache_tier(#[case] cycle: &str) {
        let mut tier = MockStatTier::new();
        tier.expect_get_data()
            .times(1)
            .withf(|q| q.cache_key() == "2024-01-01T00|g1|s1|5")
            .returning(|_| Ok(vec![record("2024-01-01T00", 7)]));

        let tiers = match cycle {
            "10" => TierSet { ten_minutes: Arc::new(tier), ..untouched_tiers() },
            _ => TierSet { half_hour: Arc::new(tier), ..untouched_tiers() },
        };

        let query = format!("{}&cycle={}", HOUR_QUERY, cycle);
        let response = gateway(tiers).handle(EndpointType::ByMinuteGranularity, &uri(DEFAULT_MINUTES_PATH, &query)).await;

        assert_eq!(response, ApiResponse::success(vec![record("2024-01-01T00", 7)]));
    }

    #[rstest]
    #[case("5")]
    #[case("60")]
    #[case("7")]
    #[case("minute")]
    #[tokio::test]
    async fn test_unknown_cycle_yields_empty_success(#[case] cycle: &str) {
        let query = format!("{}&cycle={}", HOUR_QUERY, cycle);
        let response = gateway(untouched_tiers())
            .handle(EndpointType::ByMinuteGranularity, &uri(DEFAULT_MINUTES_PATH, &query))
            .await;
        assert_eq!(response, ApiResponse::success(Vec::new()));
    }

    #[tokio::test]
    async fn test_ip_lookups_use_real_time_path() {
        let mut real_time = MockRealTimeQuery::new();
        real_time
            .expect_query_ids_by_ip()
            .times(1)
            .withf(|q| q.ip == "10.0.0.1" && q.metric_id == "5")
            .returning(|_| Ok(Vec::new()));
        real_time.expect_query_report_ips().times(1).returning(|_| Ok(Vec::new()));
        let gateway = gateway(TierSet { real_time: Arc::new(real_time), ..untouched_tiers() });

        let ids = gateway
            .handle(EndpointType::LookupIdsByIp, &uri(DEFAULT_GET_IDS_PATH, "start=a&end=b&metricId=5&ip=10.0.0.1"))
            .await;
        let ips = gateway.handle(EndpointType::LookupIpsByStream, &uri(DEFAULT_GET_IPS_PATH, HOUR_QUERY)).await;

        assert!(ids.success);
        assert!(ips.success);
    }

    #[tokio::test]
    async fn test_tier_error_is_contained() {
        let mut day = MockStatTier::new();
        day.expect_get_data()
            .returning(|_| Err(TierError::Unavailable { tier: "day".into() }));
        let gateway = gateway(TierSet { day: Arc::new(day), ..untouched_tiers() });

        let response = gateway.handle(EndpointType::ByDay, &uri(DEFAULT_DAY_PATH, HOUR_QUERY)).await;

        assert!(!response.success);
        assert!(response.err_msg.starts_with(QUERY_FAILED_MESSAGE));
        assert_eq!(gateway.metrics().request_count(EndpointType::ByDay, "error"), 1);
    }

    /// Panics on its first call only.
    #[derive(Debug, Default)]
    struct PanicOnceTier {
        calls: AtomicU64,
    }

    #[async_trait]
    impl StatTier for PanicOnceTier {
        async fn get_data(&self, _query: &StatQuery) -> TierResult<Vec<StatData>> {
            if self.calls.fetch_add(1, AtomicOrdering::SeqCst) == 0 {
                panic!("tier exploded");
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_tier_panic_does_not_break_gateway() {
        let hour = Arc::new(PanicOnceTier::default());
        let gateway = gateway(TierSet { hour, ..untouched_tiers() });
        let request = uri(DEFAULT_HOUR_PATH, HOUR_QUERY);

        let first = gateway.handle(EndpointType::ByHour, &request).await;
        let second = gateway.handle(EndpointType::ByHour, &request).await;

        assert!(!first.success);
        assert!(second.success);
    }

    #[tokio::test]
    async fn test_limiter_delays_instead_of_rejecting() {
        let api = ApiConfig { limiter_qps: 2, ..ApiConfig::default() };
        let gateway = QueryGateway::new(api, TierSet::in_memory()).unwrap();
        let request = uri(DEFAULT_HOUR_PATH, HOUR_QUERY);

        let started = Instant::now();
        for _ in 0..3 {
            assert!(gateway.handle(EndpointType::ByHour, &request).await.success);
        }
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn test_limiters_are_independent_per_endpoint() {
        let limiters = EndpointLimiters::new(1);
        assert!(limiters.try_acquire(EndpointType::ByHour));
        assert!(!limiters.try_acquire(EndpointType::ByHour));
        assert!(limiters.try_acquire(EndpointType::ByDay));
    }

    #[tokio::test]
    async fn test_hour_endpoint_end_to_end() {
        let hour = Arc::new(MemoryStatTier::new("hour"));
        let records = vec![record("2024-01-01T00", 42), record("2024-01-01T00", 8)];
        hour.insert(build_cache_key("2024-01-01T00", "g1", "s1", "5"), records.clone());
        let tiers = TierSet { hour, ..TierSet::in_memory() };
        let app = Arc::new(gateway(tiers)).router();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("{}?{}", DEFAULT_HOUR_PATH, HOUR_QUERY))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], CONTENT_TYPE_JSON);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["errMsg"], "");
        let data: Vec<StatData> = serde_json::from_value(body["data"].clone()).unwrap();
        assert_eq!(data, records);
    }

    #[tokio::test]
    async fn test_hour_endpoint_missing_stream_end_to_end() {
        let app = Arc::new(gateway(TierSet::in_memory())).router();
        let query = "start=2024-01-01T00&end=2024-01-01T01&metricId=5&groupId=g1";

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("{}?{}", DEFAULT_HOUR_PATH, query))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(
            body,
            json!({
                "success": false,
                "errMsg": format!("{}{}?{}", INVALID_PARAMS_MESSAGE, DEFAULT_HOUR_PATH, query),
                "data": [],
            })
        );
    }

    #[tokio::test]
    async fn test_configured_status_is_used_for_every_outcome() {
        let api = ApiConfig { response_status: 202, ..ApiConfig::default() };
        let app = Arc::new(QueryGateway::new(api, TierSet::in_memory()).unwrap()).router();

        let response = app
            .oneshot(Request::builder().uri(DEFAULT_DAY_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["success"], false);
    }

    #[tokio::test]
    async fn test_metrics_route_exposes_request_counters() {
        let gateway = Arc::new(gateway(TierSet::in_memory()));
        gateway.handle(EndpointType::ByHour, &uri(DEFAULT_HOUR_PATH, HOUR_QUERY)).await;

        let response = gateway
            .router()
            .oneshot(Request::builder().uri(DEFAULT_METRICS_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("audit_gateway_requests_total"));
        assert!(text.contains(r#"endpoint="hour""#));
    }

    fn day_query(start: &str, end: &str) -> StatQuery {
        StatQuery {
            start: start.into(),
            end: end.into(),
            metric_id: "5".into(),
            group_id: "g1".into(),
            stream_id: "s1".into(),
            tag: DEFAULT_AUDIT_TAG.into(),
        }
    }

    fn seeded_day_tier(tier: MemoryStatTier) -> MemoryStatTier {
        tier.insert(build_cache_key("2024-01-05", "g1", "s1", "5"), vec![record("2024-01-05", 5)]);
        tier.insert(build_cache_key("2024-01-02", "g1", "s1", "5"), vec![record("2024-01-02", 2)]);
        tier.insert(build_cache_key("2024-01-01", "g1", "s1", "5"), vec![record("2024-01-01", 1)]);
        tier.insert(
            build_cache_key("2024-01-01", "g1", "s2", "5"),
            vec![StatData { stream_id: "s2".into(), ..record("2024-01-01", 9) }],
        );
        tier
    }

    #[tokio::test]
    async fn test_ranged_tier_returns_every_day_in_range() {
        let tier = seeded_day_tier(MemoryStatTier::ranged("day"));
        assert_eq!(tier.lookup(), TierLookup::StartRange);

        let hits = tier.get_data(&day_query("2024-01-01", "2024-01-03")).await.unwrap();
        assert_eq!(hits, vec![record("2024-01-01", 1), record("2024-01-02", 2)]);

        let single = tier.get_data(&day_query("2024-01-05", "2024-01-05")).await.unwrap();
        assert_eq!(single, vec![record("2024-01-05", 5)]);
        assert!(tier.get_data(&day_query("2024-01-03", "2024-01-04")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exact_key_tier_ignores_end() {
        let tier = seeded_day_tier(MemoryStatTier::new("hour"));
        let hits = tier.get_data(&day_query("2024-01-01", "2024-01-03")).await.unwrap();
        assert_eq!(hits, vec![record("2024-01-01", 1)]);
    }

    #[tokio::test]
    async fn test_day_endpoint_serves_range_from_memory_tiers() {
        let day = seeded_day_tier(MemoryStatTier::ranged("day"));
        let tiers = TierSet { day: Arc::new(day), ..TierSet::in_memory() };
        let gateway = gateway(tiers);

        let query = "start=2024-01-01&end=2024-01-02&metricId=5&groupId=g1&streamId=s1";
        let response = gateway.handle(EndpointType::ByDay, &uri(DEFAULT_DAY_PATH, query)).await;

        assert_eq!(response, ApiResponse::success(vec![record("2024-01-01", 1), record("2024-01-02", 2)]));
    }

    #[tokio::test]
    async fn test_memory_real_time_filters_by_stream_and_range() {
        let real_time = MemoryRealTimeQuery::new();
        real_time.extend(vec![
            StatData { ip: Some("10.0.0.1".into()), ..record("2024-01-01T00:05", 1) },
            record("2024-01-01T02:00", 2),
            StatData { group_id: "other".into(), ..record("2024-01-01T00:10", 3) },
        ]);
        let query = StatQuery {
            start: "2024-01-01T00".into(),
            end: "2024-01-01T01".into(),
            metric_id: "5".into(),
            group_id: "g1".into(),
            stream_id: "s1".into(),
            tag: DEFAULT_AUDIT_TAG.into(),
        };

        assert_eq!(real_time.query_log_ts(&query).await.unwrap().len(), 1);
        assert_eq!(real_time.query_report_ips(&query).await.unwrap().len(), 1);
    }
}

#[cfg(test)]
mod service_tests {
    use super::*;
    use axum::http::Request;
    use tower::ServiceExt;

    fn quiet_store() -> MockConfigStore {
        let mut store = MockConfigStore::new();
        store.expect_is_closed().return_const(false);
        store.expect_fetch_metric_ids().returning(|| Ok(vec!["1".to_string()]));
        store.expect_fetch_data_sources().returning(|| Ok(Vec::new()));
        store.expect_close().return_const(());
        store
    }

    #[test]
    fn test_config_sync_is_built_once_across_threads() {
        let service = Arc::new(
            AuditService::new(ServiceConfig::default(), TierSet::in_memory())
                .unwrap()
                .with_config_store(Arc::new(quiet_store())),
        );

        let engines: Vec<Arc<ConfigSyncEngine>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let service = Arc::clone(&service);
                    scope.spawn(move || service.config_sync().unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(engines.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }

    #[test]
    fn test_fresh_services_are_isolated() {
        let first = AuditService::new(ServiceConfig::default(), TierSet::in_memory()).unwrap();
        let second = AuditService::new(ServiceConfig::default(), TierSet::in_memory()).unwrap();

        first.discovery().set_addresses(parse_static_addresses("a:1"));
        assert!(second.discovery().addresses().is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = ServiceConfig::default();
        config.api.limiter_qps = 0;
        assert!(AuditService::new(config, TierSet::in_memory()).is_err());
    }

    #[tokio::test]
    async fn test_init_seeds_addresses_and_serves_health() {
        let mut config = ServiceConfig::default();
        config.discovery.static_addresses = "10.0.0.1:10081;10.0.0.2:10081".into();
        let service = AuditService::new(config, TierSet::in_memory())
            .unwrap()
            .with_config_store(Arc::new(quiet_store()));

        let router = service.init().await.unwrap();
        assert_eq!(service.discovery().addresses().len(), 2);

        let sync = service.config_sync().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while sync.metric_identifiers().is_empty() && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }

        let response = router
            .oneshot(Request::builder().uri(DEFAULT_HEALTH_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let report: JsonValue = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(report["status"], "UP");
        assert_eq!(report["config_sync"]["metric_ids"], 1);
        assert_eq!(report["discovery"]["addresses"], 2);

        service.shutdown().await;
        assert!(!sync.is_running());
    }
}
