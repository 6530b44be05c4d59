use std::{
    env::{self},
    fs::OpenOptions,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use axum::{
    Router,
    extract::{MatchedPath, Request},
    middleware,
};
use axum_server::Handle;
use clap::Parser;
use rusqlite::Connection;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{EnvFilter, Layer, filter, layer::SubscriberExt, util::SubscriberInitExt};

use pesa_ledger::{
    AppState, GatewayConfig, MpesaClient, PaymentConfig, build_router, graceful_shutdown,
    logging_middleware, spawn_periodic_reconciliation,
};

/// The REST API server for pesa_ledger.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// File path to the application SQLite database.
    #[arg(long)]
    db_path: String,

    /// The port to serve the API from.
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// The public URL of this server, used to build the gateway callback URLs.
    #[arg(long, env = "SITE_URL")]
    site_url: String,

    /// The smallest amount a user may withdraw.
    #[arg(long, default_value_t = 10.0)]
    minimum_withdrawal: f64,

    /// The smallest amount a user may deposit.
    #[arg(long, default_value_t = 1.0)]
    minimum_deposit: f64,

    /// The timeout in seconds for each request to the payment gateway.
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    gateway_timeout: u64,

    /// Poll the gateway for every user's pending payments this often, in
    /// seconds. Pending payments are only checked on request if not set.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    poll_interval: Option<u64>,

    /// The canonical timezone the gateway expects timestamps in.
    #[arg(long, default_value = "Africa/Nairobi", value_parser = parse_timezone)]
    timezone: String,
}

fn parse_timezone(name: &str) -> Result<String, String> {
    match time_tz::timezones::get_by_name(name) {
        Some(_) => Ok(name.to_owned()),
        None => Err(format!("\"{name}\" is not a canonical timezone name")),
    }
}

#[tokio::main]
async fn main() {
    setup_logging();

    let args = Args::parse();

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));

    let secret = env::var("SECRET").expect("The environment variable 'SECRET' must be set");

    let payment_config = PaymentConfig {
        minimum_deposit: args.minimum_deposit,
        minimum_withdrawal: args.minimum_withdrawal,
        timezone: args.timezone.clone(),
        ..PaymentConfig::new(&args.site_url)
    };
    let gateway_config =
        GatewayConfig::new(&payment_config, Duration::from_secs(args.gateway_timeout));
    let gateway = Arc::new(MpesaClient::new(gateway_config).expect("Could not create HTTP client"));

    let conn = Connection::open(&args.db_path).expect("Could not open the database");
    let state = AppState::new(conn, &secret, payment_config, gateway)
        .expect("Could not initialize the database");

    if let Some(seconds) = args.poll_interval {
        tracing::info!("Reconciling pending payments every {seconds} seconds");
        spawn_periodic_reconciliation(
            state.db_connection.clone(),
            state.gateway.clone(),
            Duration::from_secs(seconds),
        );
    }

    let handle = Handle::new();
    tokio::spawn(graceful_shutdown(handle.clone()));

    let router = add_tracing_layer(build_router(state).layer(middleware::from_fn(logging_middleware)));

    tracing::info!("HTTP server listening on {}", addr);
    axum_server::bind(addr)
        .handle(handle)
        .serve(router.into_make_service())
        .await
        .expect("The server stopped unexpectedly");
}

fn setup_logging() {
    let stdout_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .expect("Could not create log file");

    let debug_log = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(log_file))
        .with_filter(filter::LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(stdout_log)
        .with(debug_log)
        .init();
}

fn add_tracing_layer(router: Router) -> Router {
    let tracing_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request| {
            let method = req.method();
            let uri = req.uri();

            let matched_path = req
                .extensions()
                .get::<MatchedPath>()
                .map(|matched_path| matched_path.as_str());

            tracing::debug_span!("request", %method, %uri, matched_path)
        })
        // By default, `TraceLayer` will log 5xx responses but we're doing our specific
        // logging of errors so disable that
        .on_failure(());

    router.layer(tracing_layer)
}

#[cfg(test)]
mod args_tests {
    use clap::Parser;

    use super::Args;

    const REQUIRED: [&str; 5] = ["server", "--db-path", "test.db", "--site-url", "https://example.com"];

    fn parse(extra: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(REQUIRED.iter().chain(extra))
    }

    #[test]
    fn defaults_are_valid() {
        let args = parse(&[]).unwrap();

        assert_eq!(args.gateway_timeout, 30);
        assert_eq!(args.poll_interval, None);
        assert_eq!(args.timezone, "Africa/Nairobi");
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        assert!(parse(&["--poll-interval", "0"]).is_err());
        assert_eq!(parse(&["--poll-interval", "60"]).unwrap().poll_interval, Some(60));
    }

    #[test]
    fn zero_gateway_timeout_is_rejected() {
        assert!(parse(&["--gateway-timeout", "0"]).is_err());
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        assert!(parse(&["--timezone", "Not/AZone"]).is_err());
        assert_eq!(
            parse(&["--timezone", "Africa/Kampala"]).unwrap().timezone,
            "Africa/Kampala"
        );
    }
}
