//! CLI entry point for `mailvault`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use mailvault::archive::{Archiver, ItemOutcome, RunReport, RunStatus};
use mailvault::clock::SystemClock;
use mailvault::config::{self, Config};
use mailvault::destination::{AuditReport, FolderHandle, FsStore, PathResolver};
use mailvault::kv::FileKv;
use mailvault::ledger::LedgerStore;
use mailvault::source::MboxSource;

#[derive(Parser)]
#[command(
    name = "mailvault",
    version,
    about = "Incremental, budget-bounded mailbox archiver",
    long_about = "Archives an MBOX export into a Year/Month/Day folder tree, a bounded \
                  slice per run, skipping records that were already archived."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one bounded archival pass
    Run {
        /// MBOX file to read (overrides `source.mbox`)
        #[arg(long, value_name = "FILE")]
        mbox: Option<PathBuf>,
        /// Destination root directory (overrides `destination.root`)
        #[arg(long, value_name = "DIR")]
        dest: Option<PathBuf>,
        /// Base search query (overrides `source.query`)
        #[arg(long)]
        query: Option<String>,
        /// Most records fetched in this run
        #[arg(long, value_name = "N")]
        max_records: Option<usize>,
        /// Time budget in seconds
        #[arg(long, value_name = "SECS")]
        budget: Option<u64>,
        /// Archive every candidate again, ignoring the ledger
        #[arg(short, long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },
    /// List archive folders created outside the anchor folder
    Audit {
        #[arg(long, value_name = "DIR")]
        dest: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Show ledger size and the last run cursor
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load_config();

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Run {
            mbox,
            dest,
            query,
            max_records,
            budget,
            force,
            json,
        } => {
            let mut config = config;
            if let Some(query) = query {
                config.source.query = query;
            }
            let mut options = config.run_options();
            if let Some(n) = max_records {
                options.max_records = n;
            }
            if let Some(secs) = budget {
                options.time_budget = Duration::from_secs(secs);
            }
            options.force_reprocess = force;

            let mbox = mbox.or_else(|| config.source.mbox.clone());
            let dest = dest.or_else(|| config.destination.root.clone());
            cmd_run(&config, mbox.as_deref(), dest.as_deref(), &options, json)
        }
        Commands::Audit { dest, json } => {
            let dest = dest.or_else(|| config.destination.root.clone());
            cmd_audit(&config, dest.as_deref(), json)
        }
        Commands::Stats { json } => cmd_stats(&config, json),
        Commands::InitConfig { force } => cmd_init_config(force),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_path = config::log_file_path(config);
    let log_dir = log_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config::cache_dir(config));
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_name = log_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "mailvault.log".into());
        let file_appender = tracing_appender::rolling::never(&log_dir, file_name);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

fn open_ledger(config: &Config) -> anyhow::Result<LedgerStore<FileKv>> {
    let kv = FileKv::open(config::state_dir(config), config.ledger.max_value_size)?;
    Ok(LedgerStore::open(kv, config.ledger_config())?)
}

fn require_dest(dest: Option<&Path>) -> anyhow::Result<&Path> {
    match dest {
        Some(dest) => Ok(dest),
        None => anyhow::bail!("No destination root given (use --dest or set destination.root)"),
    }
}

/// Run one archival pass and print the report.
fn cmd_run(
    config: &Config,
    mbox: Option<&Path>,
    dest: Option<&Path>,
    options: &mailvault::RunOptions,
    json: bool,
) -> anyhow::Result<()> {
    let Some(mbox) = mbox else {
        anyhow::bail!("No MBOX file given (use --mbox or set source.mbox)");
    };
    if !mbox.exists() {
        anyhow::bail!("File not found: {}", mbox.display());
    }
    let dest = require_dest(dest)?;

    let source = MboxSource::open(mbox)?;
    let store = FsStore::open(dest)?;
    let ledger = open_ledger(config)?;

    let pb = ProgressBar::new(options.max_records as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Archiving [{bar:40.cyan/blue}] {pos}/{len} ({elapsed})")?
            .progress_chars("#>-"),
    );
    if json {
        pb.set_draw_target(indicatif::ProgressDrawTarget::hidden());
    }

    let progress = pb.clone();
    let mut archiver = Archiver::new(source, store, ledger, SystemClock, config.engine_config())
        .with_progress(move |handled, total| {
            progress.set_length(total as u64);
            progress.set_position(handled as u64);
        });

    let report = archiver.run_once(options)?;
    pb.finish_and_clear();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_run_table(mbox, &report);
    }

    if report.status == RunStatus::Aborted {
        anyhow::bail!("Run aborted");
    }
    Ok(())
}

/// Check the destination for archive folders outside the anchor.
fn cmd_audit(config: &Config, dest: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let store = FsStore::open(require_dest(dest)?)?;
    let anchor = FolderHandle::root().child(config.destination.anchor.clone());
    let report = PathResolver::new(&store, anchor).audit_tree()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_audit_table(&report);
    }
    Ok(())
}

/// Show ledger and cursor state.
fn cmd_stats(config: &Config, json: bool) -> anyhow::Result<()> {
    let state_dir = config::state_dir(config);
    let ledger_config = config.ledger_config();
    let kv = FileKv::open(&state_dir, config.ledger.max_value_size)?;
    let ledger_size = std::fs::metadata(kv.path_for(&ledger_config.ledger_key))
        .map(|m| m.len())
        .unwrap_or(0);
    let ledger = LedgerStore::open(kv, ledger_config)?;
    let cursor = ledger.load_cursor()?;

    if json {
        let stats = serde_json::json!({
            "state_dir": state_dir.to_string_lossy(),
            "total_tracked": ledger.len(),
            "ledger_bytes": ledger_size,
            "ledger_recovered": ledger.recovered_from_corruption(),
            "last_window": cursor.as_ref().and_then(|c| c.last_window),
            "last_cursor": cursor,
        });
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    use humansize::{format_size, BINARY};
    println!();
    println!("  {:<22} {}", "State directory", state_dir.display());
    println!("  {:<22} {}", "Records tracked", ledger.len());
    println!("  {:<22} {}", "Ledger size", format_size(ledger_size, BINARY));
    if ledger.recovered_from_corruption() {
        println!("  {:<22} {}", "Ledger", "unreadable, will be rebuilt");
    }
    match cursor {
        Some(c) => {
            let band = c.last_window.map(|b| b.to_string()).unwrap_or_else(|| "-".into());
            println!("  {:<22} {}", "Last window", band);
            println!(
                "  {:<22} {}",
                "Last run",
                c.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!(
                "  {:<22} {}",
                "Completed",
                if c.completed { "yes" } else { "no, will resume" }
            );
            if let Some(ts) = c.last_record_timestamp {
                println!("  {:<22} {}", "Last record", ts.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
        None => println!("  {:<22} {}", "Last run", "never"),
    }
    println!();
    Ok(())
}

/// Write the default configuration to the standard location.
fn cmd_init_config(force: bool) -> anyhow::Result<()> {
    if let Some(path) = config::config_file_path() {
        if path.exists() && !force {
            anyhow::bail!(
                "Config file already exists: {} (use --force to overwrite)",
                path.display()
            );
        }
    }
    let path = config::save_config(&Config::default())?;
    println!("  Wrote {}", path.display());
    Ok(())
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mailvault", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

fn print_run_table(mbox: &Path, report: &RunReport) {
    let status = match report.status {
        RunStatus::Done => "done",
        RunStatus::BudgetExceeded => "budget exceeded, will resume",
        RunStatus::Aborted => "aborted",
    };

    println!();
    println!("  {:<20} {}", "Source", mbox.display());
    println!("  {:<20} {}", "Window", report.window.band);
    println!("  {:<20} {}", "Query", report.query);
    println!("  {:<20} {}", "Status", status);
    println!("  {:<20} {}", "Fetched", report.fetched);
    println!("  {:<20} {}", "Archived", report.processed);
    println!("  {:<20} {}", "Skipped", report.skipped);
    println!("  {:<20} {}", "Errors", report.errors);
    println!("  {:<20} {:.2?}", "Elapsed", report.elapsed());
    if report.ledger_recovered {
        println!("  {:<20} {}", "Ledger", "was unreadable and has been rebuilt");
    }

    let errors: Vec<_> = report
        .items
        .iter()
        .filter(|i| i.outcome == ItemOutcome::Error)
        .collect();
    if !errors.is_empty() {
        println!();
        println!("  Errors:");
        for item in errors {
            let id: String = item.id.chars().take(40).collect();
            println!(
                "    {:<40}  {}",
                id,
                item.reason.as_deref().unwrap_or("unknown error")
            );
        }
    }
    println!();
}

fn print_audit_table(report: &AuditReport) {
    println!();
    println!("  {:<20} {}", "Anchor", report.anchor);
    println!("  {:<20} {}", "Entries scanned", report.scanned);
    if report.is_clean() {
        println!("  {:<20} {}", "Misplaced", "none");
        println!();
        return;
    }

    println!("  {:<20} {}", "Misplaced", report.misplaced.len());
    println!();
    println!("  {:<40} {:<8} {:<20} {}", "Name", "Kind", "Created", "Pattern");
    println!("  {}", "-".repeat(90));
    for entry in &report.misplaced {
        let created = entry
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".into());
        let name: String = entry.name.chars().take(39).collect();
        println!(
            "  {:<40} {:<8} {:<20} {:?}",
            name,
            format!("{:?}", entry.kind).to_lowercase(),
            created,
            entry.pattern
        );
    }
    println!();
}
