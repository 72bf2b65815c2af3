//! Configuration for the query frontend.
//!
//! [`StaticLimits`] is the config-backed [`Limits`] implementation:
//! uniform defaults plus optional per-tenant overrides. Deployments
//! that refresh limits at runtime plug in their own [`Limits`]
//! collaborator instead.

use std::collections::HashMap;
use std::time::Duration;

use clap::Parser;

use crate::limits::Limits;

/// Top-level frontend configuration.
#[derive(Debug, Clone)]
pub struct FrontendConfig {
    /// Port the HTTP server listens on.
    pub port: u16,

    /// Base URL of the downstream query backend.
    pub downstream_url: String,

    /// Default split interval applied when a tenant carries no
    /// override. Zero disables splitting.
    pub split_queries_by_interval: Duration,

    /// Per-tenant limits.
    pub limits: StaticLimits,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            port: 3100,
            downstream_url: "http://localhost:3101".to_string(),
            split_queries_by_interval: Duration::from_secs(30 * 60),
            limits: StaticLimits::default(),
        }
    }
}

/// Uniform limit values, overridable per tenant.
///
/// A zero duration or integer disables the corresponding limit.
#[derive(Debug, Clone)]
pub struct StaticLimits {
    pub max_query_lookback: Duration,
    pub max_query_length: Duration,
    pub max_query_series: usize,
    pub max_entries_limit_per_query: usize,
    pub max_query_parallelism: usize,
    pub query_split_duration: Duration,
    pub min_sharding_lookback: Duration,
    pub per_tenant: HashMap<String, TenantOverrides>,
}

impl Default for StaticLimits {
    fn default() -> Self {
        Self {
            max_query_lookback: Duration::ZERO,
            max_query_length: Duration::from_secs(721 * 3_600),
            max_query_series: 500,
            max_entries_limit_per_query: 5_000,
            max_query_parallelism: 14,
            query_split_duration: Duration::ZERO,
            min_sharding_lookback: Duration::ZERO,
            per_tenant: HashMap::new(),
        }
    }
}

/// Optional per-tenant limit overrides; unset fields fall back to the
/// defaults.
#[derive(Debug, Clone, Default)]
pub struct TenantOverrides {
    pub max_query_lookback: Option<Duration>,
    pub max_query_length: Option<Duration>,
    pub max_query_series: Option<usize>,
    pub max_entries_limit_per_query: Option<usize>,
    pub max_query_parallelism: Option<usize>,
    pub query_split_duration: Option<Duration>,
    pub min_sharding_lookback: Option<Duration>,
}

impl StaticLimits {
    fn overrides(&self, tenant: &str) -> Option<&TenantOverrides> {
        self.per_tenant.get(tenant)
    }
}

impl Limits for StaticLimits {
    fn max_query_lookback(&self, tenant: &str) -> Duration {
        self.overrides(tenant)
            .and_then(|o| o.max_query_lookback)
            .unwrap_or(self.max_query_lookback)
    }

    fn max_query_length(&self, tenant: &str) -> Duration {
        self.overrides(tenant)
            .and_then(|o| o.max_query_length)
            .unwrap_or(self.max_query_length)
    }

    fn max_query_series(&self, tenant: &str) -> usize {
        self.overrides(tenant)
            .and_then(|o| o.max_query_series)
            .unwrap_or(self.max_query_series)
    }

    fn max_entries_limit_per_query(&self, tenant: &str) -> usize {
        self.overrides(tenant)
            .and_then(|o| o.max_entries_limit_per_query)
            .unwrap_or(self.max_entries_limit_per_query)
    }

    fn max_query_parallelism(&self, tenant: &str) -> usize {
        self.overrides(tenant)
            .and_then(|o| o.max_query_parallelism)
            .unwrap_or(self.max_query_parallelism)
    }

    fn query_split_duration(&self, tenant: &str) -> Duration {
        self.overrides(tenant)
            .and_then(|o| o.query_split_duration)
            .unwrap_or(self.query_split_duration)
    }

    fn min_sharding_lookback(&self, tenant: &str) -> Duration {
        self.overrides(tenant)
            .and_then(|o| o.min_sharding_lookback)
            .unwrap_or(self.min_sharding_lookback)
    }
}

/// Command-line arguments for the frontend binary.
#[derive(Debug, Parser)]
#[command(name = "query-frontend", about = "Log query-range frontend")]
pub struct CliArgs {
    /// Port to listen on.
    #[arg(long, default_value_t = 3100)]
    pub port: u16,

    /// Base URL of the downstream query backend.
    #[arg(long, default_value = "http://localhost:3101")]
    pub downstream_url: String,

    /// Interval to split range queries by, in seconds. Zero disables
    /// splitting.
    #[arg(long, default_value_t = 1_800)]
    pub split_interval_secs: u64,

    /// Maximum query lookback in seconds. Zero disables the limit.
    #[arg(long, default_value_t = 0)]
    pub max_query_lookback_secs: u64,

    /// Maximum query length in seconds. Zero disables the limit.
    #[arg(long, default_value_t = 721 * 3_600)]
    pub max_query_length_secs: u64,

    /// Maximum distinct series per query. Zero disables the limit.
    #[arg(long, default_value_t = 500)]
    pub max_query_series: usize,

    /// Maximum concurrent sub-requests per query.
    #[arg(long, default_value_t = 14)]
    pub max_query_parallelism: usize,
}

impl From<&CliArgs> for FrontendConfig {
    fn from(args: &CliArgs) -> Self {
        Self {
            port: args.port,
            downstream_url: args.downstream_url.clone(),
            split_queries_by_interval: Duration::from_secs(args.split_interval_secs),
            limits: StaticLimits {
                max_query_lookback: Duration::from_secs(args.max_query_lookback_secs),
                max_query_length: Duration::from_secs(args.max_query_length_secs),
                max_query_series: args.max_query_series,
                max_query_parallelism: args.max_query_parallelism,
                ..Default::default()
            },
        }
    }
}
