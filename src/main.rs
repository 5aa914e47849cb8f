use std::{process, sync::Arc};

use tessera::{
    cache::{CacheConfig, EntityType, EventSource, PageRequest},
    client::{QueryClient, QueryObserver},
    config::{self, Command, Settings, WatchArgs},
    error::AppError,
    infra::{api::ApiClient, telemetry},
    views::PaginatedView,
};
use tokio::task::JoinHandle;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

const DEFAULT_WATCHED: [EntityType; 2] = [EntityType::Linode, EntityType::Volume];

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(Command::Watch(Box::<WatchArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        Command::Watch(args) => run_watch(settings, *args).await,
    }
}

async fn run_watch(settings: Settings, args: WatchArgs) -> Result<(), AppError> {
    let api = ApiClient::new(&settings.api)?;
    let client = QueryClient::with_defaults(CacheConfig::from(&settings.cache), &api)?;

    let entities = if args.entities.is_empty() {
        DEFAULT_WATCHED.to_vec()
    } else {
        args.entities
    };

    info!(
        api = %settings.api.base_url,
        entities = ?entities,
        page_size = args.page_size,
        events = settings.events.enabled,
        "Watching entity lists"
    );

    let mut handles: Vec<JoinHandle<()>> = entities
        .iter()
        .map(|entity| {
            let view = PaginatedView::new(&client, *entity, PageRequest::new(1, args.page_size));
            spawn_logger(view.observe())
        })
        .collect();

    handles.push(client.spawn_maintenance());

    if settings.events.enabled {
        let source: Arc<dyn EventSource> = Arc::new(api.clone());
        let poller = client.events_poller(source, settings.events.poller_config());
        handles.push(poller.spawn());
    }

    let result = tokio::signal::ctrl_c()
        .await
        .map_err(|err| AppError::unexpected(format!("failed to listen for shutdown signal: {err}")));

    info!("Shutting down");
    for handle in handles {
        handle.abort();
        let _ = handle.await;
    }

    result
}

/// Log every state transition of `observer` until its entry goes away.
fn spawn_logger(mut observer: QueryObserver) -> JoinHandle<()> {
    tokio::spawn(async move {
        let key = observer.key().to_string();
        while let Some(state) = observer.changed().await {
            let items = state
                .data
                .as_deref()
                .and_then(|data| data.get("results"))
                .and_then(|results| results.as_u64());
            match &state.error {
                Some(err) => error!(key = %key, status = %state.status, error = %err, "Query failed"),
                None => info!(
                    key = %key,
                    status = %state.status,
                    results = items,
                    stale = state.is_stale,
                    fetching = state.is_fetching,
                    "Query state changed"
                ),
            }
        }
    })
}
