use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand, ValueEnum};
use ctag_core::client::{ConfluenceApi, ConfluenceClient, ConfluenceClientConfig};
use ctag_core::config::{load_config, resolve_config_path, resolve_credentials};
use ctag_core::interactive::{Confirm, DEFAULT_ABORT_KEY, InteractiveHandler};
use ctag_core::listing::{
    OutputFormat, collect_page_tags, format_page_data, format_tags_only, select_pages,
};
use ctag_core::model::{
    PageRef, ResultTally, TagCommand, TagOperation, parse_pattern_pairs, parse_tag_pairs,
};
use ctag_core::pipeline::{
    CommandObserver, CommandOutcome, PageSelection, RunOptions, resolve_pages, run_batch,
    run_command,
};
use ctag_core::query::DEFAULT_BATCH_SIZE;
use ctag_core::source::{
    CommandBatch, is_stdin_available, read_commands_from_csv, read_commands_from_json,
    read_commands_from_stdin, validate_command_file, write_example_csv,
};
use ctag_core::tags::{NoProgress, PageOutcome, ProgressSink};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "ctag",
    version,
    about = "Bulk add, remove and replace Confluence page labels selected by CQL"
)]
struct Cli {
    #[arg(long, global = true, help = "Preview changes without applying them")]
    dry_run: bool,
    #[arg(
        long,
        global = true,
        action = ArgAction::Set,
        default_value_t = true,
        default_missing_value = "true",
        num_args = 0..=1,
        require_equals = true,
        value_name = "BOOL",
        help = "Print one line per processed page to stderr (--progress=false turns it off)"
    )]
    progress: bool,
    #[arg(long, global = true, help = "Include descendants of every matched page")]
    recurse: bool,
    #[arg(long, global = true, value_name = "PATH", help = "Secrets file (TOML)")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved configuration diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, action = ArgAction::Count, help = "Increase log verbosity")]
    verbose: u8,
    #[arg(short, long, global = true, conflicts_with = "verbose", help = "Disable logging")]
    quiet: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    config: Option<PathBuf>,
    diagnostics: bool,
    progress: bool,
    run: RunOptions,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
            progress: cli.progress,
            run: RunOptions {
                dry_run: cli.dry_run,
                recurse: cli.recurse,
                batch_size: DEFAULT_BATCH_SIZE,
                expand: None,
            },
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Add tags to pages matching a CQL expression")]
    Add(TagArgs),
    #[command(about = "Remove tags from pages matching a CQL expression")]
    Remove(RemoveArgs),
    #[command(about = "Replace tags (old=new) on pages matching a CQL expression")]
    Replace(ReplaceArgs),
    #[command(about = "Show tags of pages matching a CQL expression")]
    Get(GetArgs),
    #[command(name = "from_json", alias = "from-json", about = "Run commands from a JSON file")]
    FromJson(FileArgs),
    #[command(name = "from_csv", alias = "from-csv", about = "Run commands from a CSV file")]
    FromCsv(FileArgs),
    #[command(
        name = "from_stdin_json",
        alias = "from-stdin-json",
        about = "Run JSON commands read from stdin"
    )]
    FromStdinJson(StdinArgs),
    #[command(about = "Check a CSV or JSON command file without running it")]
    Validate(ValidateArgs),
    #[command(name = "example-csv", about = "Write an example CSV command file")]
    ExampleCsv(ExampleCsvArgs),
}

#[derive(Debug, Args)]
struct SharedArgs {
    #[arg(long, value_name = "CQL", help = "Skip pages matched by this CQL expression")]
    cql_exclude: Option<String>,
    #[arg(long, help = "Confirm each page before changing it")]
    interactive: bool,
    #[arg(
        long,
        default_value = DEFAULT_ABORT_KEY,
        help = "Answer that aborts all remaining operations"
    )]
    abort_key: String,
}

#[derive(Debug, Args)]
struct TagArgs {
    cql_expression: String,
    #[arg(required = true, num_args = 1..)]
    tags: Vec<String>,
    #[command(flatten)]
    shared: SharedArgs,
}

#[derive(Debug, Args)]
struct RemoveArgs {
    #[command(flatten)]
    target: TagArgs,
    #[arg(long, help = "Treat each tag as a regular expression matched against current labels")]
    regex: bool,
}

#[derive(Debug, Args)]
struct ReplaceArgs {
    cql_expression: String,
    /// `OLD=NEW` pairs, or `PATTERN NEW` pairs with --regex.
    #[arg(required = true, num_args = 1.., value_name = "PAIRS")]
    pairs: Vec<String>,
    #[arg(long, help = "Match old tags by regular expression; pairs become PATTERN NEW")]
    regex: bool,
    #[command(flatten)]
    shared: SharedArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Table,
    Json,
}

impl From<FormatArg> for OutputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Table => OutputFormat::Table,
            FormatArg::Json => OutputFormat::Json,
        }
    }
}

#[derive(Debug, Args)]
struct GetArgs {
    cql_expression: String,
    #[arg(long, value_enum, default_value_t = FormatArg::Table)]
    format: FormatArg,
    #[arg(long, help = "Show only the unique tags across all pages")]
    tags_only: bool,
    #[arg(long, help = "Leave page titles and spaces out of the output")]
    no_show_pages: bool,
    #[arg(long, value_name = "PATH", help = "Write results to a file")]
    output_file: Option<PathBuf>,
    #[command(flatten)]
    shared: SharedArgs,
}

#[derive(Debug, Args)]
struct FileArgs {
    file: PathBuf,
    #[arg(
        long,
        default_value = DEFAULT_ABORT_KEY,
        help = "Answer that aborts all remaining operations"
    )]
    abort_key: String,
}

#[derive(Debug, Args)]
struct StdinArgs {
    #[arg(
        long,
        default_value = DEFAULT_ABORT_KEY,
        help = "Answer that aborts all remaining operations"
    )]
    abort_key: String,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    file: PathBuf,
}

#[derive(Debug, Args)]
struct ExampleCsvArgs {
    #[arg(default_value = "ctag_commands.csv")]
    path: PathBuf,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Add(args)) => {
            let operation = TagOperation::Add(args.tags);
            run_single(&runtime, operation, &args.cql_expression, args.shared)
        }
        Some(Commands::Remove(args)) => {
            let mut operation = TagOperation::Remove(args.target.tags);
            if args.regex {
                operation = operation.into_matching()?;
            }
            run_single(&runtime, operation, &args.target.cql_expression, args.target.shared)
        }
        Some(Commands::Replace(args)) => {
            let operation = if args.regex {
                TagOperation::Replace(parse_pattern_pairs(&args.pairs)?).into_matching()?
            } else {
                TagOperation::Replace(parse_tag_pairs(&args.pairs)?)
            };
            run_single(&runtime, operation, &args.cql_expression, args.shared)
        }
        Some(Commands::Get(args)) => run_get(&runtime, args),
        Some(Commands::FromJson(args)) => {
            let batch = read_commands_from_json(&args.file)?;
            run_commands(&runtime, batch, "the JSON file", &args.abort_key)
        }
        Some(Commands::FromCsv(args)) => {
            let batch = read_commands_from_csv(&args.file)?;
            run_commands(&runtime, batch, "the CSV file", &args.abort_key)
        }
        Some(Commands::FromStdinJson(args)) => run_stdin(&runtime, &args.abort_key),
        Some(Commands::Validate(args)) => run_validate(args),
        Some(Commands::ExampleCsv(args)) => {
            write_example_csv(&args.path)?;
            println!("Created example CSV file: {}", args.path.display());
            Ok(())
        }
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    if quiet {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_log_directives(verbose)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

/// Filter for the ctag targets only; dependencies stay at their defaults.
fn default_log_directives(verbose: u8) -> String {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    format!("ctag={level},ctag_core={level}")
}

fn connect(runtime: &RuntimeOptions) -> Result<ConfluenceClient> {
    let cwd = env::current_dir().context("failed to resolve current directory")?;
    let location = resolve_config_path(runtime.config.as_deref(), &cwd);
    let config = load_config(&location.path)?;
    let credentials = resolve_credentials(&config)?;
    let client = ConfluenceClient::new(ConfluenceClientConfig::from_credentials(
        &credentials,
        &config,
    ))?;

    if runtime.diagnostics {
        eprintln!("\n[diagnostics]");
        eprintln!(
            "config_path: {} ({}, {})",
            location.path.display(),
            location.source.as_str(),
            if location.path.exists() { "found" } else { "missing" }
        );
        eprintln!("api_root: {}", client.api_root());
        eprintln!("{}", credentials.diagnostics());
        eprintln!();
    }
    Ok(client)
}

fn run_single(
    runtime: &RuntimeOptions,
    operation: TagOperation,
    cql_expression: &str,
    shared: SharedArgs,
) -> Result<()> {
    let command = TagCommand::new(
        operation,
        cql_expression,
        shared.interactive,
        shared.cql_exclude.as_deref(),
    )?;
    let mut api = connect(runtime)?;
    let mut observer = ConsoleObserver::new(runtime, &shared.abort_key, false);

    let outcome = run_command(&mut api, &command, &runtime.run, &mut observer);
    observer.command_finished(1, &command, &outcome);
    print_request_count(&api);
    Ok(())
}

fn run_stdin(runtime: &RuntimeOptions, abort_key: &str) -> Result<()> {
    if !is_stdin_available() {
        bail!(
            "no input on stdin; pipe a JSON command document, e.g. `cat commands.json | ctag from_stdin_json`"
        );
    }
    let batch = read_commands_from_stdin()?;
    if batch.commands.iter().any(TagCommand::interactive) {
        warn!("stdin carries the command document; interactive confirmations will abort");
    }
    run_commands(runtime, batch, "the JSON data", abort_key)
}

fn run_commands(
    runtime: &RuntimeOptions,
    batch: CommandBatch,
    source: &str,
    abort_key: &str,
) -> Result<()> {
    println!("Found {} commands in {source}.", batch.commands.len());
    if let Some(description) = &batch.description {
        println!("Description: {description}");
    }
    if batch.rejected > 0 {
        println!("Skipped {} invalid commands.", batch.rejected);
    }
    if batch.commands.is_empty() {
        println!("No valid commands to execute.");
        return Ok(());
    }

    let mut api = connect(runtime)?;
    let mut observer = ConsoleObserver::new(runtime, abort_key, true);
    let report = run_batch(&mut api, &batch.commands, &runtime.run, &mut observer);

    if report.stopped_by_abort && report.executed < report.commands {
        println!(
            "\nSkipped {} remaining commands.",
            report.commands - report.executed
        );
    }
    print_tally("Overall Results", &report.overall);
    print_request_count(&api);
    Ok(())
}

fn run_get(runtime: &RuntimeOptions, args: GetArgs) -> Result<()> {
    let mut api = connect(runtime)?;
    let cql_expression = args.cql_expression.trim();
    if cql_expression.is_empty() {
        bail!("cql_expression must be non-empty");
    }

    eprintln!("Finding pages matching: {cql_expression}");
    let selection = resolve_pages(
        &mut api,
        cql_expression,
        args.shared
            .cql_exclude
            .as_deref()
            .filter(|value| !value.trim().is_empty()),
        &runtime.run,
    );
    report_selection(&selection, true);
    if selection.is_empty() {
        return Ok(());
    }

    eprintln!("Retrieving tags for pages...");
    let listing = collect_page_tags(&mut api, &selection.pages);
    let pages = if args.shared.interactive {
        let mut handler = InteractiveHandler::stdio(true, Some(args.shared.abort_key.as_str()));
        select_pages(listing.pages, &mut handler)
    } else {
        listing.pages
    };

    let format = OutputFormat::from(args.format);
    let content = if args.tags_only {
        format_tags_only(&listing.all_tags, format)?
    } else {
        format_page_data(&pages, format, !args.no_show_pages)?
    };

    match &args.output_file {
        Some(path) => {
            fs::write(path, format!("{content}\n"))
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("Results saved to {}", path.display());
        }
        None => println!("{content}"),
    }

    eprintln!("\nSummary:");
    eprintln!("  Total pages processed: {}", pages.len());
    eprintln!("  Unique tags found: {}", listing.all_tags.len());
    Ok(())
}

fn run_validate(args: ValidateArgs) -> Result<()> {
    let report = validate_command_file(&args.file)?;
    println!("file: {}", args.file.display());
    println!("format: {}", report.format.as_str());
    println!("valid_commands: {}", report.valid_commands);
    println!("invalid_commands: {}", report.rejected);
    Ok(())
}

/// Prints command progress to stdout as the pipeline reports it.
struct ConsoleObserver {
    abort_key: String,
    dry_run: bool,
    batch: bool,
    progress: Box<dyn ProgressSink>,
}

impl ConsoleObserver {
    fn new(runtime: &RuntimeOptions, abort_key: &str, batch: bool) -> Self {
        let progress: Box<dyn ProgressSink> = if runtime.progress {
            Box::new(StderrProgress)
        } else {
            Box::new(NoProgress)
        };
        Self {
            abort_key: abort_key.to_string(),
            dry_run: runtime.run.dry_run,
            batch,
            progress,
        }
    }
}

impl CommandObserver for ConsoleObserver {
    fn command_started(&mut self, position: usize, count: usize, command: &TagCommand) {
        println!("\nExecuting command {position}/{count}: {command}");
    }

    fn pages_resolved(&mut self, command: &TagCommand, selection: &PageSelection) {
        println!("Finding pages matching: {}", command.cql_expression());
        report_selection(selection, false);
        if self.dry_run && !selection.is_empty() {
            println!("DRY RUN: No changes will be made.");
        }
    }

    fn command_finished(
        &mut self,
        position: usize,
        _command: &TagCommand,
        outcome: &CommandOutcome,
    ) {
        match outcome {
            CommandOutcome::NoPages => {}
            CommandOutcome::DryRun { previews } => {
                for line in previews {
                    println!("{line}");
                }
            }
            CommandOutcome::Applied(tally) => {
                let label = if self.batch {
                    format!("Results for command {position}")
                } else {
                    "Results".to_string()
                };
                print_tally(&label, tally);
                if tally.aborted {
                    println!("\nAborted by user. Stopping execution.");
                }
            }
        }
    }

    fn confirmer(&mut self, _command: &TagCommand) -> Option<Box<dyn Confirm>> {
        Some(Box::new(InteractiveHandler::stdio(true, Some(self.abort_key.as_str()))))
    }

    fn progress(&mut self) -> &mut dyn ProgressSink {
        self.progress.as_mut()
    }
}

struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn page_done(&mut self, position: usize, total: usize, page: &PageRef, outcome: PageOutcome) {
        eprintln!(
            "[{position}/{total}] {} {}",
            outcome.as_str(),
            page.display_title()
        );
    }
}

fn report_selection(selection: &PageSelection, to_stderr: bool) {
    let mut lines = Vec::new();
    if selection.matched == 0 {
        lines.push("No pages found matching the CQL expression.".to_string());
    } else {
        lines.push(format!("Found {} matching pages.", selection.matched));
        if selection.exclusion_applied {
            lines.push(format!(
                "Excluded {} pages. {} pages remaining.",
                selection.excluded,
                selection.pages.len()
            ));
        }
    }
    for line in lines {
        if to_stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }
}

fn print_tally(label: &str, tally: &ResultTally) {
    println!("\n{label}:");
    println!("  Total pages: {}", tally.total);
    println!("  Processed: {}", tally.processed);
    println!("  Skipped: {}", tally.skipped);
    println!("  Successful: {}", tally.success);
    println!("  Failed: {}", tally.failed);
}

fn print_request_count(api: &ConfluenceClient) {
    tracing::info!(requests = api.request_count(), "finished");
}

#[cfg(test)]
mod tests {
    use super::default_log_directives;

    #[test]
    fn log_directives_are_scoped_to_ctag_targets() {
        assert_eq!(default_log_directives(0), "ctag=warn,ctag_core=warn");
        assert_eq!(default_log_directives(1), "ctag=info,ctag_core=info");
        assert_eq!(default_log_directives(3), "ctag=debug,ctag_core=debug");
    }
}
