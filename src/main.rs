use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use colored::{ColoredString, Colorize};
use tracing_subscriber::EnvFilter;

use git_relay::auth::{self, ChainedCredentials, Credential, NetrcCredentials, StaticCredentials};
use git_relay::errors::EXIT_USAGE;
use git_relay::protocol::{CommandType, RefStatus, RefUpdate};
use git_relay::{Endpoint, Relay, RelayConfig, RelayError, RelayOutcome, TracingSink};

/// Mirror the refs of one Git remote onto another, relaying a single pack without a local clone.
#[derive(Parser, Debug)]
#[command(name = "git-relay", version, about, long_about = None)]
struct Cli {
    /// Remote to read from (file://, ssh:// or http(s)://).
    #[arg(long)]
    source: String,

    /// Remote to update.
    #[arg(long)]
    target: String,

    /// Print the ref differences without fetching or pushing.
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Read HTTP credentials from a netrc file (default: $NETRC or ~/.netrc).
    #[arg(long, num_args = 0..=1, value_name = "PATH")]
    netrc: Option<Option<PathBuf>>,

    /// Environment variable holding a bearer token for HTTP remotes.
    #[arg(long, value_name = "VAR")]
    token_env: Option<String>,

    /// Private key for SSH remotes.
    #[arg(long, value_name = "PATH")]
    ssh_key: Option<PathBuf>,

    /// Ref glob to mirror; repeatable. Defaults to `refs/*`.
    #[arg(long = "include-ref", value_name = "GLOB")]
    include_refs: Vec<String>,

    /// Ref glob to leave alone; repeatable, wins over --include-ref.
    #[arg(long = "exclude-ref", value_name = "GLOB")]
    exclude_refs: Vec<String>,

    /// Keep target refs that no longer exist on the source.
    #[arg(long)]
    no_prune: bool,

    /// Do not request an atomic push.
    #[arg(long)]
    no_atomic: bool,

    /// JSON configuration file; flags override its values.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the outcome as JSON.
    #[arg(long)]
    json: bool,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<RelayConfig> {
    let mut config = match &cli.config {
        Some(path) => RelayConfig::from_json_file(path)?,
        None => RelayConfig::default(),
    };
    config.dry_run |= cli.dry_run;
    if !cli.include_refs.is_empty() {
        config.include_refs = cli.include_refs.clone();
    }
    config.exclude_refs.extend(cli.exclude_refs.iter().cloned());
    if cli.no_prune {
        config.prune = false;
    }
    if cli.no_atomic {
        config.atomic = false;
    }
    config.validate()?;
    Ok(config)
}

fn credentials(cli: &Cli) -> Result<ChainedCredentials> {
    let mut chain = ChainedCredentials::new();
    if let Some(var) = &cli.token_env {
        let token = std::env::var(var)
            .map_err(|_| RelayError::Config(format!("environment variable {var} is not set")))?;
        chain.push(Arc::new(StaticCredentials::new(Credential::Bearer(token))));
    }
    if let Some(path) = &cli.ssh_key {
        chain.push(Arc::new(StaticCredentials::new(Credential::SshKey {
            path: path.clone(),
        })));
    }
    if let Some(path) = &cli.netrc {
        match path.clone().or_else(NetrcCredentials::default_path) {
            Some(path) => chain.push(Arc::new(NetrcCredentials::load(&path)?)),
            None => tracing::warn!("no netrc file found"),
        }
    }
    Ok(chain)
}

fn command_label(update: &RefUpdate) -> &'static str {
    match update.command_type() {
        CommandType::Create => "CREATE",
        CommandType::Update => "UPDATE",
        CommandType::Delete => "DELETE",
    }
}

fn status_of(outcome: &RelayOutcome, update: &RefUpdate) -> ColoredString {
    if outcome.dry_run {
        return "pending".yellow();
    }
    if outcome.skipped.contains(update) {
        return "skipped (no delete-refs)".yellow();
    }
    match outcome.report.per_ref.get(&update.name) {
        Some(RefStatus::Ok) => "ok".green(),
        Some(RefStatus::Rejected(reason)) => format!("rejected: {reason}").red(),
        None => "-".normal(),
    }
}

fn print_outcome(outcome: &RelayOutcome) {
    if outcome.updates.is_empty() {
        println!("{}", "Everything up-to-date".green());
        return;
    }
    let width = outcome
        .updates
        .iter()
        .map(|u| u.name.len())
        .max()
        .unwrap_or(0);
    for update in &outcome.updates {
        println!(
            "{:<6}  {:<width$}  {}",
            command_label(update).bold(),
            update.name,
            status_of(outcome, update)
        );
    }
    if !outcome.dry_run {
        println!(
            "{} bytes relayed, {} progress messages",
            outcome.bytes_relayed, outcome.progress_messages
        );
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = load_config(&cli)?;
    let chain = credentials(&cli)?;
    let source = Endpoint::parse(&cli.source).context("--source")?;
    let target = Endpoint::parse(&cli.target).context("--target")?;
    let source = auth::resolve(source, &chain).await?;
    let target = auth::resolve(target, &chain).await?;

    let relay = Relay::new(config, Arc::new(TracingSink))?;
    let outcome = relay.run(&source, &target).await?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }
    Ok(outcome.exit_code())
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_USAGE } else { 0 };
            let _ = e.print();
            return exit_code(code);
        }
    };
    init_tracing(&cli.log_level);

    match run(cli).await {
        Ok(code) => exit_code(code),
        Err(e) => match e.downcast_ref::<RelayError>() {
            Some(relay_error) => {
                eprintln!(
                    "{} {}: {e:#}",
                    "error".red().bold(),
                    relay_error.kind()
                );
                exit_code(relay_error.exit_code())
            }
            None => {
                eprintln!("{} {e:#}", "error".red().bold());
                exit_code(EXIT_USAGE)
            }
        },
    }
}
