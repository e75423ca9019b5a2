use actix_web::{get, middleware, App, HttpRequest, HttpResponse, HttpServer, Responder};
use cdkts_operator::cdkstack::{controller, sweep};
use cdkts_operator::config::ReconcilerConfig;
use cdkts_operator::metrics::MetricsSink;
use cdkts_operator::telemetry;

use clap::{crate_authors, crate_description, crate_version, Parser};
use kube::Client;
use tokio_cron_scheduler::{Job, JobScheduler};

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[derive(Parser, Debug)]
#[command(
    name = "cdkts-operator",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u32,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,cdkts_operator=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint. Tracing is disabled when unset.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,

    #[command(flatten)]
    reconciler: ReconcilerConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    let log_filter = if args.reconciler.debug_mode {
        "debug".to_owned()
    } else {
        args.log_filter.clone()
    };
    telemetry::init(
        &log_filter,
        args.log_format,
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;

    let client = Client::try_default().await?;
    let metrics = MetricsSink::open(
        &args.reconciler.metrics_path,
        args.reconciler.metrics_prefix.clone(),
    )
    .await?;

    let ctx = controller::Context::new(
        client.clone(),
        metrics,
        args.reconciler.max_retries,
        args.reconciler.retry_backoff(),
    );

    let reconciler_task = controller::run(client, ctx.clone());

    let mut scheduler = JobScheduler::new().await?;

    let drift_ctx = ctx.clone();
    scheduler
        .add(Job::new_async(
            args.reconciler.drift_check_cron.as_str(),
            move |_uuid, _l| {
                let ctx = drift_ctx.clone();
                Box::pin(async move {
                    if let Err(e) = sweep::drift_sweep(&ctx.store, &ctx.metrics).await {
                        tracing::error!(error = %e, "drift sweep failed");
                    }
                })
            },
        )?)
        .await?;

    let git_sync_ctx = ctx.clone();
    scheduler
        .add(Job::new_async(
            args.reconciler.git_sync_check_cron.as_str(),
            move |_uuid, _l| {
                let ctx = git_sync_ctx.clone();
                Box::pin(async move {
                    if let Err(e) = sweep::git_sync_sweep(&ctx.store, &ctx.metrics).await {
                        tracing::error!(error = %e, "git-sync sweep failed");
                    }
                })
            },
        )?)
        .await?;

    scheduler.start().await?;

    let server = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
    })
    .bind(format!("0.0.0.0:{}", args.port))?
    .shutdown_timeout(5);

    // Both runtimes implement graceful shutdown, so poll until both are done.
    tokio::join!(reconciler_task, server.run()).1?;
    Ok(())
}
