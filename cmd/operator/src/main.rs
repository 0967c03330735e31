use std::sync::Arc;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::{crate_authors, crate_description, crate_version, Parser};
use kube::{Api, Config};
use prometheus_client::registry::Registry;

use reconciler_core::controller::{self, State};
use reconciler_core::metrics::Metrics;
use reconciler_core::telemetry;
use reconciler_core::{ReconcilerBuilder, ReconcilerConfig};
use reconciler_k8s_util::client::new_client_with_shared_metrics;
use reconciler_k8s_util::metrics::MetricsLayer;

use reconciler_bin::crd::WebApp;
use reconciler_bin::generator::WebAppGenerator;

#[get("/metrics")]
async fn metrics(c: Data<State<WebApp>>, _req: HttpRequest) -> impl Responder {
    HttpResponse::Ok()
        .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
        .body(c.metrics())
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[derive(Parser, Debug)]
#[command(
    name = "component-reconciler",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u32,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,component-reconciler=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint.
    ///
    /// This optional argument specifies the URL to which traces will be sent using
    /// OpenTelemetry. If not provided, tracing will be disabled.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing.
    ///
    /// Specifies the ratio of traces to sample. A value of `1.0` will sample all traces,
    /// while a lower value will sample fewer traces. The default is `0.1`, meaning 10%
    /// of traces are sampled.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,

    /// How long dependent-object manifests cached per component may go
    /// unreferenced before the target-client cache evicts the client that
    /// produced them (SPEC_FULL.md §4.7).
    #[arg(long, default_value = "15m", env)]
    client_cache_ttl: humantime::Duration,

    /// Default requeue interval for reconciled components with no per-instance override.
    #[arg(long, default_value = "10m", env)]
    requeue_interval: humantime::Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(
        &args.log_filter,
        args.log_format,
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;

    let mut registry = Registry::with_prefix("component-reconciler");
    let metrics_layer = MetricsLayer::new(&mut registry);
    let config = Config::infer().await?;
    let client = new_client_with_shared_metrics(config, metrics_layer.clone())?;

    let requeue_interval = args.requeue_interval.into();
    let reconciler_config = ReconcilerConfig {
        requeue_interval,
        retry_interval: requeue_interval,
        reconcile_timeout: requeue_interval,
        client_cache_ttl: args.client_cache_ttl.into(),
        ..ReconcilerConfig::default()
    };

    let reconciler = ReconcilerBuilder::new(
        "component-reconciler",
        client.clone(),
        WebAppGenerator,
        reconciler_config,
        Arc::new(Metrics::default()),
        metrics_layer,
    )
    .setup();

    let state = State::new(Arc::new(reconciler));
    let controller = controller::run(state.clone(), Api::<WebApp>::all(client));

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
            .service(metrics)
    })
    .bind(format!("0.0.0.0:{}", args.port))?
    .shutdown_timeout(5);

    // Both runtimes implement graceful shutdown, so poll until both are done
    tokio::join!(controller, server.run()).1?;
    Ok(())
}
