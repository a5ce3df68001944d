use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use sqlx::SqlitePool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use judge::config::{
    CliArgs, Config, DispatchMode, DispatcherConfig, ProviderKind, QueueBackend, QueueConfig,
    ServerConfig,
};
use judge::database as db;
use judge::language::LanguageRegistry;
use judge::queue::{MemoryQueue, SqliteQueue, SubmissionQueue};
use judge::sandbox::{EnvironmentProvider, IsolateProvider, Judge, SimpleProvider};
use judge::web_server::build_server;
use judge::worker::{Dispatcher, WakeSignal};

/// Everything the service needs besides its queue and provider
struct Service {
    server: ServerConfig,
    dispatcher: DispatcherConfig,
    queue: QueueConfig,
    db_pool: SqlitePool,
    languages: Arc<LanguageRegistry>,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server,
        dispatcher,
        queue,
        sandbox,
        languages,
        problems,
    } = cli.to_config().context("Failed to load configuration")?;

    if dispatcher.workers == 0 {
        bail!("The number of dispatcher workers must not be 0");
    }

    let db_path = db::get_db_path()?;
    if cli.flush_data {
        db::remove_db(&db_path);
    }

    let db_pool = db::init_db(&db_path)
        .await
        .context("Failed to initialize database")?;
    for problem in &problems {
        db::upsert_problem(&db_pool, problem)
            .await
            .with_context(|| format!("Failed to store problem {}", problem.id))?;
    }
    log::info!("Loaded {} problems", problems.len());

    let service = Service {
        server,
        dispatcher,
        queue,
        db_pool,
        languages: Arc::new(LanguageRegistry::with_config(&languages)),
    };
    let command_timeout = Duration::from_secs(sandbox.command_timeout_secs);

    match sandbox.provider {
        ProviderKind::Simple => {
            let provider = SimpleProvider::build(sandbox.work_root, command_timeout)?;
            with_queue(service, provider).await
        }
        ProviderKind::Isolate => {
            if !IsolateProvider::is_available() {
                bail!("The isolate provider is configured but `isolate` was not found");
            }
            let provider =
                IsolateProvider::build(sandbox.first_box_id, sandbox.box_count, command_timeout)?;
            with_queue(service, provider).await
        }
    }
}

async fn with_queue<P: EnvironmentProvider>(service: Service, provider: P) -> anyhow::Result<()> {
    match service.queue.backend {
        QueueBackend::Memory => {
            log::warn!("In-memory queue: submissions queued at shutdown are lost");
            serve(service, Arc::new(MemoryQueue::new()), provider).await
        }
        QueueBackend::Sqlite => {
            let poll_interval = Duration::from_millis(service.queue.poll_interval_ms);
            let queue = SqliteQueue::new(service.db_pool.clone(), poll_interval);
            serve(service, Arc::new(queue), provider).await
        }
    }
}

async fn serve<Q, P>(service: Service, queue: Arc<Q>, provider: P) -> anyhow::Result<()>
where
    Q: SubmissionQueue,
    P: EnvironmentProvider,
{
    let Service {
        server: server_config,
        dispatcher: dispatcher_config,
        db_pool,
        languages,
        ..
    } = service;

    let dispatcher = Dispatcher::new(
        Arc::clone(&queue),
        Arc::new(db_pool.clone()),
        Arc::new(Judge::new(provider)),
        Arc::clone(&languages),
        dispatcher_config.batch_size,
    );
    let wake = Arc::new(WakeSignal::new());
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let mut workers = JoinSet::new();
    match dispatcher_config.mode {
        DispatchMode::Continuous => {
            for i in 1..=dispatcher_config.workers {
                workers.spawn(dispatcher.clone().run_continuous(i, shutdown_token.clone()));
            }
        }
        DispatchMode::Triggered => {
            workers.spawn(dispatcher.run_triggered(Arc::clone(&wake), shutdown_token.clone()));
        }
    }

    let server = build_server(server_config, db_pool, queue, languages, wake)
        .context("Failed to build server")?;

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Shutdown actix-web server gracefully
    server_handle.stop(true).await;

    // 2. Broadcast shutdown signal to workers
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    // 3. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            if e.is_panic() {
                log::error!("Worker handle panicked: {:?}", e);
            } else {
                log::error!("Worker handle finished with error: {:?}", e);
            }
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}
