//! Binary entry point for the redoline recovery CLI.
#![forbid(unsafe_code)]

mod config;
mod ui;

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use redoline::admin::{
    checkpoint_info, init, pending, recover, AdminError, AdminOpenOptions, CheckpointReport,
    InitReport, SpaceSpec,
};
use redoline::recovery::{PendingReport, RecoveryOutcome, RecoveryReport, ScanEnd};
use tracing_subscriber::EnvFilter;

use config::CliConfig;
use ui::{Theme, Ui};

#[derive(Parser, Debug)]
#[command(
    name = "redoline",
    version,
    about = "Crash recovery and redo log inspection for redoline data directories",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "REDOLINE_CONFIG",
        value_name = "FILE",
        help = "Config file (defaults to the user config directory)"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for reports"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = ThemeArg::Auto,
        help = "Colour theme for text output"
    )]
    theme: ThemeArg,

    #[command(flatten)]
    open: OpenArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, global = true, help = "Page size in bytes")]
    page_size: Option<usize>,

    #[arg(long, global = true, help = "Buffer pool size in pages")]
    pool_pages: Option<usize>,

    #[arg(long, global = true, help = "Recovery worker threads")]
    threads: Option<usize>,

    #[arg(
        long,
        global = true,
        value_name = "BYTES",
        help = "Memory for parsed redo records before a partial apply"
    )]
    log_buffer: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create a data directory with an empty redo log")]
    Init {
        #[arg(value_name = "DIR")]
        dir: Option<PathBuf>,

        #[arg(
            long = "space",
            value_name = "ID:NAME",
            value_parser = parse_space,
            help = "Tablespace to create (repeatable)"
        )]
        spaces: Vec<SpaceSpec>,
    },

    #[command(about = "Replay the redo log and report consistent, inconsistent or fatal")]
    Recover {
        #[arg(value_name = "DIR")]
        dir: Option<PathBuf>,

        #[arg(long, help = "Replay in memory only; write nothing")]
        read_only: bool,
    },

    #[command(about = "Count redo records waiting for each page")]
    Pending {
        #[arg(value_name = "DIR")]
        dir: Option<PathBuf>,

        #[arg(long, default_value_t = 50, help = "Pages to list in text output")]
        limit: usize,
    },

    #[command(about = "Show the log header and checkpoint slots")]
    Checkpoint {
        #[arg(value_name = "DIR")]
        dir: Option<PathBuf>,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ThemeArg {
    Auto,
    Light,
    Dark,
    Plain,
}

impl From<ThemeArg> for Theme {
    fn from(theme: ThemeArg) -> Self {
        match theme {
            ThemeArg::Auto => Theme::Auto,
            ThemeArg::Light => Theme::Light,
            ThemeArg::Dark => Theme::Dark,
            ThemeArg::Plain => Theme::Plain,
        }
    }
}

fn parse_space(raw: &str) -> Result<SpaceSpec, String> {
    let (id, name) = raw
        .split_once(':')
        .ok_or_else(|| format!("invalid tablespace '{raw}', expected ID:NAME"))?;
    let space = id
        .trim()
        .parse()
        .map_err(|_| format!("invalid tablespace id '{id}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("tablespace name must not be empty".into());
    }
    Ok(SpaceSpec {
        space,
        name: name.to_string(),
    })
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run() -> Result<ExitCode, Box<dyn Error>> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.clone())?;
    let opts = build_open_options(&config, &cli.open);
    let ui = Ui::new(cli.theme.into());

    match cli.command {
        Command::Init { dir, spaces } => {
            let dir = resolve_dir(dir, &config)?;
            let report = init(&dir, &opts, &spaces)?;
            emit(cli.format, &report, || print_init_text(&ui, &report))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Recover { dir, read_only } => {
            let dir = resolve_dir(dir, &config)?;
            let mut opts = opts;
            opts.recovery.read_only |= read_only;
            let outcome = recover(&dir, &opts)?;
            emit(cli.format, &outcome, || print_outcome_text(&ui, &outcome))?;
            // exit codes are 0, 1 or 2
            Ok(ExitCode::from(outcome.exit_code() as u8))
        }
        Command::Pending { dir, limit } => {
            let dir = resolve_dir(dir, &config)?;
            let report = pending(&dir, &opts)?;
            emit(cli.format, &report, || print_pending_text(&ui, &report, limit))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Checkpoint { dir } => {
            let dir = resolve_dir(dir, &config)?;
            let report = checkpoint_info(&dir, &opts)?;
            emit(cli.format, &report, || print_checkpoint_text(&ui, &report))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn resolve_dir(dir: Option<PathBuf>, config: &CliConfig) -> Result<PathBuf, AdminError> {
    dir.or_else(|| config.default_data_dir().cloned()).ok_or_else(|| {
        let hint = config
            .path()
            .map(|p| format!(" or set data_dir in {}", p.display()))
            .unwrap_or_default();
        AdminError::Message(format!("no data directory given; pass DIR{hint}"))
    })
}

fn build_open_options(config: &CliConfig, args: &OpenArgs) -> AdminOpenOptions {
    let mut opts = config.open_options();
    if let Some(page_size) = args.page_size {
        opts.page_size = page_size;
    }
    if let Some(pool_pages) = args.pool_pages {
        opts.pool.pool_pages = pool_pages;
    }
    if let Some(threads) = args.threads {
        opts.recovery.threads = threads;
    }
    if let Some(bytes) = args.log_buffer {
        opts.recovery.log_buffer_budget = bytes;
    }
    opts
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: FnOnce(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_init_text(ui: &Ui, report: &InitReport) {
    ui.success(&format!("initialized {}", report.dir.display()));
    ui.section(
        "Log",
        [
            ("page size", report.page_size.to_string()),
            ("checkpoint lsn", report.checkpoint.lsn.to_string()),
            ("checkpoint end", report.checkpoint.end_lsn.to_string()),
        ],
    );
    ui.list(
        "Tablespaces",
        report
            .spaces
            .iter()
            .map(|s| format!("{} {}", s.space, s.name)),
    );
}

fn scan_end_text(end: Option<&ScanEnd>) -> String {
    match end {
        Some(ScanEnd::EndOfLog { reason }) => (*reason).to_string(),
        Some(ScanEnd::Corrupt { lsn, reason }) => format!("corrupt record at {lsn}: {reason}"),
        None => "not scanned".to_string(),
    }
}

fn print_report_text(ui: &Ui, report: &RecoveryReport) {
    ui.section(
        "Log",
        [
            ("checkpoint", report.checkpoint.lsn.to_string()),
            ("scanned to", report.scanned_lsn.to_string()),
            ("file end", report.log_end_lsn.to_string()),
            ("scan stopped", scan_end_text(report.scan_end.as_ref())),
            ("mini-transactions", report.mtrs_scanned.to_string()),
            ("file operations", report.file_ops.to_string()),
        ],
    );
    ui.section(
        "Apply",
        [
            ("batches", report.apply.batches.to_string()),
            ("pages recovered", report.apply.pages_recovered.to_string()),
            ("records applied", report.apply.records_applied.to_string()),
            ("records skipped", report.apply.records_skipped.to_string()),
            ("doublewrite restores", report.apply.doublewrite_restores.to_string()),
            ("memory rewinds", report.oom_rewinds.to_string()),
        ],
    );
    ui.list(
        "Skipped pages",
        report
            .failures
            .iter()
            .map(|f| format!("{} {:?}: {}", f.page, f.kind, f.reason)),
    );
    if let Some(cp) = &report.new_checkpoint {
        ui.section(
            "New checkpoint",
            [
                ("number", cp.checkpoint_no.to_string()),
                ("lsn", cp.lsn.to_string()),
            ],
        );
    }
}

fn print_outcome_text(ui: &Ui, outcome: &RecoveryOutcome) {
    if let Some(report) = outcome.report() {
        print_report_text(ui, report);
    }
    match outcome {
        RecoveryOutcome::Consistent(r) if r.failures.is_empty() => ui.success(&outcome.summary()),
        RecoveryOutcome::Consistent(_) | RecoveryOutcome::Inconsistent(_) => {
            ui.warn(&outcome.summary())
        }
        RecoveryOutcome::Fatal { .. } => ui.error(&outcome.summary()),
    }
}

fn print_pending_text(ui: &Ui, report: &PendingReport, limit: usize) {
    ui.section(
        "Log",
        [
            ("checkpoint", report.checkpoint.lsn.to_string()),
            ("scanned to", report.scanned_lsn.to_string()),
            ("scan stopped", scan_end_text(report.scan_end.as_ref())),
            ("pages", report.pages.len().to_string()),
            ("records", report.total_records.to_string()),
        ],
    );
    ui.list(
        "Pending records",
        report
            .pages
            .iter()
            .take(limit)
            .map(|p| format!("{} {}", p.page, p.records)),
    );
    if report.pages.len() > limit {
        ui.warn(&format!("{} more pages not shown", report.pages.len() - limit));
    }
}

fn print_checkpoint_text(ui: &Ui, report: &CheckpointReport) {
    ui.section(
        "Header",
        [
            ("start lsn", report.header.start_lsn.to_string()),
            ("sequence bit", report.header.seq_bit.to_string()),
            ("salt", format!("{:#018x}", report.header.salt)),
            ("log end", report.log_end_lsn.to_string()),
        ],
    );
    ui.list(
        "Slots",
        report.slots.iter().map(|s| match &s.checkpoint {
            Some(cp) => format!(
                "slot {}: no={} lsn={} end={}",
                s.slot, cp.checkpoint_no, cp.lsn, cp.end_lsn
            ),
            None => format!("slot {}: empty or invalid", s.slot),
        }),
    );
    match (&report.selected, report.checkpoint_age) {
        (Some(cp), Some(age)) => {
            let level = if age >= report.capacity.max_checkpoint_age {
                "over the checkpoint limit"
            } else if age >= report.capacity.max_modified_age_async {
                "flushing advised"
            } else {
                "within margins"
            };
            ui.success(&format!(
                "recovery starts at checkpoint {} (lsn {}), {age} bytes of log, {level}",
                cp.checkpoint_no, cp.lsn
            ));
        }
        _ => ui.error("no valid checkpoint"),
    }
}
