//! Tool hub command-line entry point.
//!
//! Loads a catalog snapshot and exposes:
//! - `list`: catalog tools with their status
//! - `dirs`: home and temp directories used for templating
//! - `invoke`: run a command-line tool (streams output for stream tools)
//! - `test`: run a tool's testcases and print the report
//! - `service`: start a service tool, keep it up until Ctrl-C, then stop it

use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use toolhub::engine::{CallLogJanitor, OutputEvent, StreamKind};
use toolhub::tools::{CmdToolInput, ToolRepository};
use toolhub::{CallContext, Config, Invocation, MemoryCatalog, ToolHub};

#[derive(Parser, Debug)]
#[command(name = "toolhub")]
#[command(about = "Run catalog tools behind concurrency groups, dependency checks and testcases")]
#[command(version)]
struct Cli {
    /// Catalog snapshot (JSON)
    #[arg(short = 'C', long, env = "TOOLHUB_CATALOG")]
    catalog: PathBuf,

    /// Engine configuration file (defaults to $TOOLHUB_CONFIG, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List catalog tools
    List,

    /// Show directories used by working-directory templates
    Dirs,

    /// Invoke a command-line tool
    Invoke {
        /// Tool name
        tool: String,

        /// Template argument, repeatable (`--arg name=value`)
        #[arg(short, long = "arg", value_parser = parse_key_value)]
        args: Vec<(String, String)>,

        /// Environment override, repeatable (`--env KEY=value`)
        #[arg(short, long = "env", value_parser = parse_key_value)]
        env: Vec<(String, String)>,

        /// Data written to the process's stdin
        #[arg(long, default_value = "")]
        stdin: String,

        /// Working directory override (`~`, `$HOME` and `$TEMP` are expanded)
        #[arg(short = 'w', long)]
        working_dir: Option<String>,

        /// Timeout override (e.g. `30s`, `2m`)
        #[arg(short, long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,

        /// Name of the calling tool
        #[arg(long)]
        caller: Option<String>,
    },

    /// Run a tool's testcases and record Ready/Error
    Test {
        /// Tool name
        tool: String,
    },

    /// Start a service tool and stop it on Ctrl-C
    Service {
        /// Tool name
        tool: String,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    toolhub::observability::init_tracing_with(&config.observability);

    let catalog: Arc<dyn ToolRepository> = Arc::new(MemoryCatalog::from_file(&cli.catalog)?);
    let hub = ToolHub::new(catalog.clone(), config.engine.clone())?;
    let mut janitor = CallLogJanitor::new(catalog.clone(), config.janitor.clone());
    let _janitor_task = janitor.start();

    let ctx = CallContext::new();
    let outcome = run(&cli.command, &hub, catalog.as_ref(), &ctx).await;

    janitor.stop();
    hub.shutdown().await;
    outcome
}

async fn run(
    command: &Command,
    hub: &ToolHub,
    catalog: &dyn ToolRepository,
    ctx: &CallContext,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::List => {
            for tool in catalog.list_tools().await? {
                println!(
                    "{:<6} {:<24} {:<13} {:<8} {}",
                    tool.id(),
                    tool.name(),
                    tool.kind().as_str(),
                    format!("{:?}", tool.status()).to_lowercase(),
                    tool.error()
                );
            }
        }
        Command::Dirs => {
            println!("{}", serde_json::to_string_pretty(&hub.get_dirs())?);
        }
        Command::Invoke {
            tool,
            args,
            env,
            stdin,
            working_dir,
            timeout,
            caller,
        } => {
            let input = CmdToolInput {
                args: args.iter().cloned().collect(),
                env: env.iter().cloned().collect(),
                stdin: stdin.clone(),
                working_dir: working_dir.clone(),
                timeout: *timeout,
                caller: caller.clone(),
            };
            match hub.invoke_by_name(tool, input, ctx).await? {
                Invocation::Buffered(output) => {
                    print!("{}", output.stdout);
                    eprint!("{}", output.stderr);
                }
                Invocation::Streamed(mut stream) => {
                    let mut stdout = tokio::io::stdout();
                    let mut stderr = tokio::io::stderr();
                    while let Some(event) = stream.next().await {
                        match event? {
                            OutputEvent::Chunk(chunk) => match chunk.stream {
                                StreamKind::Stdout => stdout.write_all(&chunk.data).await?,
                                StreamKind::Stderr => stderr.write_all(&chunk.data).await?,
                            },
                            OutputEvent::Exited { exit_code, elapsed } => {
                                tracing::info!(?exit_code, ?elapsed, "stream finished");
                            }
                        }
                    }
                    stdout.flush().await?;
                }
            }
        }
        Command::Test { tool } => {
            let id = catalog.get_tool_by_name(tool).await?.id();
            let report = hub.run_testcases(id, ctx).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.passed {
                return Err(report.summary().into());
            }
        }
        Command::Service { tool } => {
            let id = catalog.get_tool_by_name(tool).await?.id();
            let info = hub.start_service(id, ctx).await?;
            tracing::info!(service = %tool, pid = ?info.pid, "service running; Ctrl-C to stop");

            tokio::select! {
                signal = tokio::signal::ctrl_c() => signal?,
                _ = wait_until_down(hub, id) => {
                    let info = hub.service_info(id);
                    return Err(format!("service '{}' stopped: {}", tool, info.error).into());
                }
            }
            hub.stop_service(id, ctx).await?;
        }
    }
    Ok(())
}

/// Resolves once the service leaves the running state on its own.
async fn wait_until_down(hub: &ToolHub, id: toolhub::types::ToolId) {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        ticker.tick().await;
        if hub.service_info(id).state != toolhub::engine::ServiceState::Running {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_accepts_working_dir_override() {
        let cli = Cli::try_parse_from([
            "toolhub",
            "--catalog",
            "catalog.json",
            "invoke",
            "echo",
            "--arg",
            "message=hi",
            "--working-dir",
            "~/scratch",
            "--timeout",
            "30s",
        ])
        .unwrap();
        match cli.command {
            Command::Invoke {
                args,
                working_dir,
                timeout,
                ..
            } => {
                assert_eq!(args, vec![("message".to_string(), "hi".to_string())]);
                assert_eq!(working_dir.as_deref(), Some("~/scratch"));
                assert_eq!(timeout, Some(Duration::from_secs(30)));
            }
            other => panic!("expected invoke, got {:?}", other),
        }
    }
}
