use std::collections::VecDeque;
use std::sync::Arc;

use df_middleware::collaborators::{ExternalSystems, InMemorySystems};
use df_middleware::domain::EventSource;
use df_middleware::infra::Store;
use df_middleware::server::{self, Config};
use df_middleware::telemetry::{init_telemetry, TelemetryConfig};

fn print_help() {
    eprintln!(
        "\
df-middleware

USAGE:
  df-middleware [command] [options]

COMMANDS:
  serve                           Run the HTTP server and workers (default)
  migrate                         Apply database migrations and exit
  drain                           Route pending events once, then exit
  enqueue-pending                 Queue a dispatch job for every pending event
  reconcile                       Run one reconciliation sweep

COMMON OPTIONS:
  --database-url <sqlite_url>     (defaults to env DATABASE_URL)
  --source <crm|dialer|messaging|broadcast>
                                  (drain, enqueue-pending) restrict to one source
"
    );
}

struct Options {
    database_url: Option<String>,
    source: Option<EventSource>,
}

fn parse_options(args: &mut VecDeque<String>) -> anyhow::Result<Option<Options>> {
    let mut options = Options {
        database_url: None,
        source: None,
    };
    while let Some(arg) = args.pop_front() {
        match arg.as_str() {
            "--database-url" => {
                options.database_url = Some(
                    args.pop_front()
                        .ok_or_else(|| anyhow::anyhow!("missing value for --database-url"))?,
                );
            }
            "--source" => {
                let raw = args
                    .pop_front()
                    .ok_or_else(|| anyhow::anyhow!("missing value for --source"))?;
                options.source = Some(raw.parse()?);
            }
            "-h" | "--help" => return Ok(None),
            other => anyhow::bail!("unexpected argument: {other}"),
        }
    }
    Ok(Some(options))
}

async fn open_services(config: &Config) -> anyhow::Result<server::Services> {
    let store = Store::connect(&config.database_url, config.max_connections).await?;
    let systems: Arc<dyn ExternalSystems> = Arc::new(InMemorySystems::new(store.mappings()));
    Ok(server::build_services(store, systems, config).await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry(&TelemetryConfig::from_env())?;

    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let command = args.pop_front().unwrap_or_else(|| "serve".to_string());

    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_help();
        return Ok(());
    }

    let Some(options) = parse_options(&mut args)? else {
        print_help();
        return Ok(());
    };

    let mut config = Config::from_env()?;
    if let Some(url) = options.database_url {
        config.database_url = url;
    }

    match command.as_str() {
        "serve" => server::run(config).await,
        "migrate" => {
            let store = Store::connect(&config.database_url, 1).await?;
            store.pool().close().await;
            println!("ok: migrations applied");
            Ok(())
        }
        "drain" => {
            let services = open_services(&config).await?;
            let mut drain = config.scheduler.drain.clone();
            drain.source = options.source;
            let report = services.scheduler.drain(&drain).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        "enqueue-pending" => {
            let services = open_services(&config).await?;
            let report = services.scheduler.enqueue_pending(options.source).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        "reconcile" => {
            let services = open_services(&config).await?;
            let run = services.reconcile.run("cli").await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
            Ok(())
        }
        other => {
            print_help();
            anyhow::bail!("unknown command: {other}")
        }
    }
}
