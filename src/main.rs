//! mend - autonomous code repair loop
//!
//! CLI entry point: one-shot or continuous cycles over one or more
//! workspaces, with structured logs on stderr.

use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;

use mend::kernel::{CancelToken, Kernel, KernelConfig, EXIT_LOCK_BUSY, EXIT_SUCCESS};
use mend::scanner::parse_severity_filter;

#[derive(Parser)]
#[command(name = "mend")]
#[command(version = "0.6.3")]
#[command(about = "Autonomous code repair loop: scan, select, patch, verify, learn", long_about = None)]
struct Cli {
    /// Single cycle then exit (default behavior)
    #[arg(long, conflicts_with = "loop_mode")]
    once: bool,

    /// Continuous cycles every --interval seconds
    #[arg(long = "loop")]
    loop_mode: bool,

    /// Seconds between cycles in loop mode
    #[arg(long, default_value = "300", value_name = "N")]
    interval: u64,

    /// Resume from prior state
    #[arg(long)]
    resume: bool,

    /// Skip EXECUTE and VERIFY phases; never mutates workspace files
    #[arg(long)]
    dry_run: bool,

    /// Commit changes to version control on VERIFY success
    #[arg(long)]
    auto_commit: bool,

    /// Require human approval before applying a patch
    #[arg(long)]
    approve: bool,

    /// Workspace root
    #[arg(long, default_value = ".", value_name = "PATH")]
    workspace: PathBuf,

    /// Multiple workspaces, visited sequentially
    #[arg(long, num_args = 1.., value_name = "PATH")]
    workspaces: Option<Vec<PathBuf>>,

    /// Model for patch generation
    #[arg(long, value_name = "NAME")]
    llm_model: Option<String>,

    /// Escalation model after the default model is exhausted
    #[arg(long, value_name = "NAME")]
    llm_strong_model: Option<String>,

    /// Webhook endpoint notified on cycle end and PAUSED
    #[arg(long, value_name = "URL")]
    webhook_url: Option<String>,

    /// Lint severities promoted to candidates (comma separated:
    /// error,caution,advisory)
    #[arg(long, default_value = "error", value_name = "L,...")]
    lint_severity: String,

    /// JSON structured logs on stderr
    #[arg(long)]
    log_json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(json: bool, verbose: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(if verbose { "debug" } else { "info" }));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_json, cli.verbose);

    let lint_severity = match parse_severity_filter(&cli.lint_severity) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            std::process::exit(2);
        }
    };

    let mut config = KernelConfig::new(cli.workspace.clone());
    config.resume = cli.resume;
    config.dry_run = cli.dry_run;
    config.auto_commit = cli.auto_commit;
    config.approve = cli.approve;
    config.webhook_url = cli.webhook_url.clone();
    config.lint_severity = lint_severity;
    config.interval = Duration::from_secs(cli.interval);
    if let Some(model) = cli.llm_model.clone() {
        config.llm_model = model;
    }
    if let Some(model) = cli.llm_strong_model.clone() {
        config.llm_strong_model = model;
    }

    let workspaces: Vec<PathBuf> = cli
        .workspaces
        .clone()
        .unwrap_or_else(|| vec![cli.workspace.clone()]);

    let cancel = CancelToken::new();
    cancel.install_ctrl_c_handler();
    let kernel = Kernel::new(config).with_cancel_token(cancel);

    let loop_mode = cli.loop_mode && !cli.once;
    let exit_code = if loop_mode {
        kernel.run_loop(&workspaces).await
    } else {
        kernel.run_workspaces(&workspaces).await
    };

    let label = match exit_code {
        EXIT_SUCCESS => "completed".green().bold(),
        EXIT_LOCK_BUSY => "lock busy".yellow().bold(),
        _ => "paused".yellow().bold(),
    };
    eprintln!("{} {label} (exit code {exit_code})", "mend:".bold());
    std::process::exit(exit_code);
}
