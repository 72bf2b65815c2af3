//! Query frontend binary entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use url::Url;

use query_frontend::clock::SystemClock;
use query_frontend::codec::Codec;
use query_frontend::config::{CliArgs, FrontendConfig};
use query_frontend::limits::{Limits, LimitsMiddleware, SplitByOverride};
use query_frontend::metrics::Metrics;
use query_frontend::middleware::Middleware;
use query_frontend::parser::SelectorParser;
use query_frontend::roundtrip::{BoundedRoundTripper, HttpTransport};
use query_frontend::series_limit::SeriesLimiterMiddleware;
use query_frontend::server::FrontendServer;
use query_frontend::split::SplitByIntervalMiddleware;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse CLI arguments
    let args = CliArgs::parse();
    let config = FrontendConfig::from(&args);

    tracing::info!("Starting with config: {:?}", config);

    let downstream = Url::parse(&config.downstream_url).expect("invalid downstream URL");

    let clock = Arc::new(SystemClock);
    let parser = Arc::new(SelectorParser);
    let limits: Arc<dyn Limits> = Arc::new(SplitByOverride::new(
        Arc::new(config.limits.clone()),
        config.split_queries_by_interval,
    ));

    let codec = Arc::new(Codec::new(clock.clone()));
    let metrics = Arc::new(Metrics::new());

    // limits clamp first, then splitting; the series limiter sits
    // below the split so it observes every sub-response
    let middlewares: Vec<Arc<dyn Middleware>> = vec![
        Arc::new(LimitsMiddleware::new(
            limits.clone(),
            clock,
            parser,
            metrics.clone(),
        )),
        Arc::new(SplitByIntervalMiddleware::new(limits.clone())),
        Arc::new(SeriesLimiterMiddleware::new(limits.clone(), metrics.clone())),
    ];

    let frontend = Arc::new(BoundedRoundTripper::new(
        Arc::new(HttpTransport::new(downstream)),
        codec,
        limits,
        middlewares,
        metrics.clone(),
    ));

    let server = FrontendServer::new(frontend, metrics, config.port);
    server.run().await;
}
