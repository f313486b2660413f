use anyhow::Context;
use mailsyncd::daemon::{DaemonConfig, DaemonRuntime};
use mailsyncd::sync::controller::SyncConfig;
use mailsyncd::sync::session::SyncType;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const DEFAULT_HISTORY_LIMIT: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Status,
    Start(SyncConfig),
    Stop,
    Resume,
    Cleanup,
    History { limit: u32 },
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(CliMode::Run);
    };
    let rest: Vec<String> = args.collect();
    let mode = match command.as_str() {
        "run" => CliMode::Run,
        "status" => CliMode::Status,
        "start" => CliMode::Start(parse_start_args(&rest)?),
        "stop" => CliMode::Stop,
        "resume" => CliMode::Resume,
        "cleanup" => CliMode::Cleanup,
        "history" => CliMode::History {
            limit: parse_history_args(&rest)?,
        },
        "--help" | "-h" | "help" => return Ok(CliMode::Help),
        other => anyhow::bail!("unknown argument: {other}"),
    };
    if !matches!(mode, CliMode::Start(_) | CliMode::History { .. }) {
        if let Some(extra) = rest.first() {
            anyhow::bail!("unexpected argument for {command}: {extra}");
        }
    }
    Ok(mode)
}

fn parse_start_args(args: &[String]) -> anyhow::Result<SyncConfig> {
    let mut config = SyncConfig::new(SyncType::Incremental, "cli");
    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let mut value = || {
            iter.next()
                .cloned()
                .with_context(|| format!("{flag} requires a value"))
        };
        match flag.as_str() {
            "--type" => {
                let raw = value()?;
                config.sync_type = SyncType::parse(&raw)
                    .with_context(|| format!("unsupported sync type: {raw}"))?;
            }
            "--max" => {
                let raw = value()?;
                config.max_records = Some(
                    raw.parse()
                        .with_context(|| format!("--max expects a number, got {raw}"))?,
                );
            }
            "--start-date" => config.start_date = Some(value()?),
            "--end-date" => config.end_date = Some(value()?),
            "--query" => config.query_filter = Some(value()?),
            other => anyhow::bail!("unknown start option: {other}"),
        }
    }
    Ok(config)
}

fn parse_history_args(args: &[String]) -> anyhow::Result<u32> {
    match args {
        [] => Ok(DEFAULT_HISTORY_LIMIT),
        [flag, value] if flag == "--limit" => value
            .parse()
            .with_context(|| format!("--limit expects a number, got {value}")),
        [other, ..] => anyhow::bail!("unknown history option: {other}"),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("MAILSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_help() {
    println!("Usage: mailsyncd [run|status|start|stop|resume|cleanup|history]");
    println!("  run       Run the status daemon (default)");
    println!("  status    Print the unified sync status");
    println!("  start     Start a sync: --type full|incremental|date_range --max N");
    println!("            --start-date D --end-date D --query Q");
    println!("  stop      Stop the running sync");
    println!("  resume    Resume the most recent sync");
    println!("  cleanup   Mark every active session stopped");
    println!("  history   List recent sessions (--limit N)");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_help();
        return Ok(());
    }

    init_tracing();
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Run => daemon.run().await,
        CliMode::Status => print_json(&daemon.aggregator().get_status().await),
        CliMode::Start(config) => print_json(&daemon.controller().start(config).await?),
        CliMode::Stop => print_json(&daemon.controller().stop().await?),
        CliMode::Resume => print_json(&daemon.controller().resume().await?),
        CliMode::Cleanup => print_json(&daemon.controller().cleanup().await),
        CliMode::History { limit } => print_json(&daemon.store().history(limit).await?),
        CliMode::Help => Ok(()),
    }
}
