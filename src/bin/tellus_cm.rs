use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use tellus_climate_manager::app::{
    App, CleanResult, FetchReport, ProgressEvent, ProgressSink, RequestReport, RunResult,
    StatusResult, VerifyResult,
};
use tellus_climate_manager::cds::{ArchiveClient, CdsHttpClient, RetrievalRequest};
use tellus_climate_manager::config::{ConfigLoader, ResolvedConfig, ResolvedRequest};
use tellus_climate_manager::dataset::{DatasetReader, NetcdfDatasetReader};
use tellus_climate_manager::domain::{
    BoundingBox, SplitGranularity, TaskState, default_hours, parse_date, parse_hour,
};
use tellus_climate_manager::error::TellusError;
use tellus_climate_manager::merge::MergeOutcome;
use tellus_climate_manager::output::{JsonOutput, OutputMode};
use tellus_climate_manager::store::Store;

#[derive(Parser)]
#[command(name = "tellus-cm")]
#[command(about = "Bulk ERA5-Land downloader with task splitting, retries and verification")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Path to tellus-cm.json
    #[arg(long, global = true)]
    config: Option<String>,

    /// Overrides the configured output directory
    #[arg(long, global = true)]
    output_dir: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download every configured request (or a one-off request)")]
    Fetch(FetchArgs),
    #[command(about = "Re-run tasks recorded as failed")]
    Retry,
    #[command(about = "Re-check completed downloads against their files")]
    Verify,
    #[command(about = "Show per-task download status")]
    Status,
    #[command(about = "Remove leftover staging files")]
    Clean,
    #[command(about = "Concatenate completed downloads along the time axis")]
    Merge(MergeArgs),
}

#[derive(Args, Clone)]
struct FetchArgs {
    /// Archive-side variable names for a one-off request
    #[arg(long, value_delimiter = ',')]
    variables: Vec<String>,

    /// First day, YYYY-MM-DD
    #[arg(long)]
    start: Option<String>,

    /// Last day, YYYY-MM-DD
    #[arg(long)]
    end: Option<String>,

    /// Bounding box: north west south east
    #[arg(long, num_args = 4, allow_negative_numbers = true)]
    area: Option<Vec<f64>>,

    /// Hours of day, e.g. 00:00,06:00,12:00,18:00
    #[arg(long, value_delimiter = ',')]
    hours: Option<Vec<String>>,

    #[arg(long)]
    split_by: Option<SplitGranularity>,

    /// Merge the request's files after a fully completed run
    #[arg(long)]
    merge: bool,

    #[arg(long)]
    merged_name: Option<String>,
}

#[derive(Args)]
struct MergeArgs {
    /// Output file name under the data directory
    #[arg(long)]
    output: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(tellus) = report.downcast_ref::<TellusError>() {
            return ExitCode::from(map_exit_code(tellus));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &TellusError) -> u8 {
    match error {
        TellusError::MissingConfig
        | TellusError::ConfigRead(_)
        | TellusError::ConfigParse(_)
        | TellusError::TaskNotFound(_) => 2,
        TellusError::Retrieval(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let config = load_config(cli.config.as_deref())?;

    let store = match cli
        .output_dir
        .clone()
        .or_else(|| config.as_ref().and_then(|resolved| resolved.output_dir.clone()))
    {
        Some(root) => Store::at(root),
        None => Store::new().into_diagnostic()?,
    };
    let options = config
        .as_ref()
        .map(|resolved| resolved.options.clone())
        .unwrap_or_default();
    let mapping = config
        .as_ref()
        .map(|resolved| resolved.mapping.clone())
        .unwrap_or_default();

    match cli.command {
        Commands::Fetch(args) => {
            let client = CdsHttpClient::new(
                config.as_ref().and_then(|resolved| resolved.archive_url.clone()),
                config.as_ref().and_then(|resolved| resolved.api_token.clone()),
            )
            .into_diagnostic()?;
            let app = App::new(store, client, NetcdfDatasetReader, mapping, options);
            run_fetch(args, app, config, output_mode)
        }
        Commands::Retry => {
            let client = CdsHttpClient::new(
                config.as_ref().and_then(|resolved| resolved.archive_url.clone()),
                config.as_ref().and_then(|resolved| resolved.api_token.clone()),
            )
            .into_diagnostic()?;
            let app = App::new(store, client, NetcdfDatasetReader, mapping, options);
            run_retry(app, output_mode)
        }
        Commands::Verify => {
            let app = App::new(store, NopArchive, NetcdfDatasetReader, mapping, options);
            run_verify(app, output_mode)
        }
        Commands::Status => {
            let app = App::new(store, NopArchive, NetcdfDatasetReader, mapping, options);
            run_status(app, output_mode)
        }
        Commands::Clean => {
            let app = App::new(store, NopArchive, NetcdfDatasetReader, mapping, options);
            run_clean(app, output_mode)
        }
        Commands::Merge(args) => {
            let app = App::new(store, NopArchive, NetcdfDatasetReader, mapping, options);
            run_merge(args, app, output_mode)
        }
    }
}

fn load_config(path: Option<&str>) -> miette::Result<Option<ResolvedConfig>> {
    match ConfigLoader::resolve(path) {
        Ok(resolved) => Ok(Some(resolved)),
        Err(TellusError::MissingConfig) => Ok(None),
        Err(err) => Err(err).into_diagnostic(),
    }
}

#[derive(Clone, Copy)]
struct NopArchive;

impl ArchiveClient for NopArchive {
    fn retrieve(
        &self,
        _request: &RetrievalRequest,
        _destination: &std::path::Path,
    ) -> Result<(), TellusError> {
        Err(TellusError::Retrieval(
            "archive client not configured".to_string(),
        ))
    }
}

struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn event(&self, event: ProgressEvent) {
        eprintln!("\x1b[2m{}\x1b[0m", event.message);
    }
}

fn run_fetch<C: ArchiveClient + 'static, D: DatasetReader + 'static>(
    args: FetchArgs,
    app: App<C, D>,
    config: Option<ResolvedConfig>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let requests = if args.variables.is_empty() {
        let config = config.ok_or(TellusError::MissingConfig).into_diagnostic()?;
        if config.requests.is_empty() {
            return Err(miette::Report::msg(
                "config lists no enabled requests (try `tellus-cm fetch --variables ...`)",
            ));
        }
        config.requests
    } else {
        vec![one_off_request(&args).into_diagnostic()?]
    };

    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::NonInteractive => &JsonOutput,
        OutputMode::Interactive => &ConsoleSink,
    };

    let mut reports = Vec::new();
    for request in requests {
        let tasks = request.tasks().into_diagnostic()?;
        if matches!(output_mode, OutputMode::Interactive) {
            println!("\x1b[36mrequest {}: {} task(s)\x1b[0m", request.name, tasks.len());
        }
        let run = app.fetch(&tasks, sink).into_diagnostic()?;

        let all_completed = !run.tasks.is_empty()
            && run
                .tasks
                .iter()
                .all(|outcome| outcome.state == TaskState::Completed);
        let merged = if request.merge && all_completed {
            let name = request
                .merged_name
                .clone()
                .unwrap_or_else(|| format!("ERA5_Land_{}_merged.nc", request.name));
            let inputs: Vec<Utf8PathBuf> = run.files.iter().map(Utf8PathBuf::from).collect();
            Some(app.merge_files(&inputs, &name, sink).into_diagnostic()?)
        } else {
            if request.merge {
                tracing::warn!(
                    "request {} did not complete every task, skipping merge",
                    request.name
                );
            }
            None
        };

        reports.push(RequestReport {
            name: request.name.clone(),
            run,
            merged,
        });
    }

    let report = FetchReport { requests: reports };
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_fetch(&report).into_diagnostic()?,
        OutputMode::Interactive => print_fetch_summary(&report),
    }
    Ok(())
}

fn one_off_request(args: &FetchArgs) -> Result<ResolvedRequest, TellusError> {
    let start = args.start.as_deref().ok_or_else(|| {
        TellusError::ConfigParse("--start is required for a one-off request".to_string())
    })?;
    let end = args.end.as_deref().ok_or_else(|| {
        TellusError::ConfigParse("--end is required for a one-off request".to_string())
    })?;
    let area = match args.area.as_deref() {
        Some(&[north, west, south, east]) => Some(BoundingBox::new(north, west, south, east)?),
        Some(_) => {
            return Err(TellusError::InvalidArea(
                "expected north west south east".to_string(),
            ));
        }
        None => None,
    };
    let hours = match &args.hours {
        Some(values) => values
            .iter()
            .map(|value| parse_hour(value))
            .collect::<Result<Vec<_>, TellusError>>()?,
        None => default_hours(),
    };
    Ok(ResolvedRequest {
        name: "cli".to_string(),
        variables: args.variables.clone(),
        start: parse_date(start)?,
        end: parse_date(end)?,
        area,
        hours,
        split_by: args.split_by.unwrap_or(SplitGranularity::Month),
        merge: args.merge,
        merged_name: args.merged_name.clone(),
    })
}

fn run_retry<C: ArchiveClient + 'static, D: DatasetReader + 'static>(
    app: App<C, D>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.retry_failed(&JsonOutput).into_diagnostic()?;
            JsonOutput::print_run(&result).into_diagnostic()?;
        }
        OutputMode::Interactive => {
            let result = app.retry_failed(&ConsoleSink).into_diagnostic()?;
            print_run_summary("retry", &result);
        }
    }
    Ok(())
}

fn run_verify<C: ArchiveClient + 'static, D: DatasetReader + 'static>(
    app: App<C, D>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.verify_completed(&JsonOutput).into_diagnostic()?;
            JsonOutput::print_verify(&result).into_diagnostic()?;
        }
        OutputMode::Interactive => {
            let result = app.verify_completed(&ConsoleSink).into_diagnostic()?;
            print_verify_summary(&result);
        }
    }
    Ok(())
}

fn run_status<C: ArchiveClient + 'static, D: DatasetReader + 'static>(
    app: App<C, D>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let result = app.status_summary().into_diagnostic()?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_status(&result).into_diagnostic()?,
        OutputMode::Interactive => print_status_summary(&result),
    }
    Ok(())
}

fn run_clean<C: ArchiveClient + 'static, D: DatasetReader + 'static>(
    app: App<C, D>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.clean_temp(&JsonOutput).into_diagnostic()?;
            JsonOutput::print_clean(&result).into_diagnostic()?;
        }
        OutputMode::Interactive => {
            let result = app.clean_temp(&ConsoleSink).into_diagnostic()?;
            print_clean_summary(&result);
        }
    }
    Ok(())
}

fn run_merge<C: ArchiveClient + 'static, D: DatasetReader + 'static>(
    args: MergeArgs,
    app: App<C, D>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let name = args
        .output
        .unwrap_or_else(|| "ERA5_Land_merged.nc".to_string());
    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.merge_completed(&name, &JsonOutput).into_diagnostic()?;
            JsonOutput::print_merge(&result).into_diagnostic()?;
        }
        OutputMode::Interactive => {
            let result = app.merge_completed(&name, &ConsoleSink).into_diagnostic()?;
            print_merge_summary(&result);
        }
    }
    Ok(())
}

fn print_fetch_summary(report: &FetchReport) {
    for request in &report.requests {
        print_run_summary(&request.name, &request.run);
        if let Some(merged) = &request.merged {
            println!(
                "\x1b[36mmerged {} file(s) -> {} ({} records)\x1b[0m",
                merged.files, merged.output, merged.records
            );
        }
    }
}

fn print_run_summary(name: &str, result: &RunResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!(
        "{cyan}{name}: {} completed, {} failed{reset}",
        result.counts.completed, result.counts.failed
    );
    for task in &result.tasks {
        match task.state {
            TaskState::Completed => {
                println!(
                    "{green}  ok {} ({} attempt(s)){reset}",
                    task.key, task.attempts
                );
                if let Some(file) = &task.file {
                    println!("{green}     {file}{reset}");
                }
            }
            _ => {
                println!(
                    "{red}  failed {} ({} attempt(s)){reset}",
                    task.key, task.attempts
                );
                if let Some(error) = &task.error {
                    println!("{red}     {error}{reset}");
                }
            }
        }
        for warning in &task.warnings {
            println!("{yellow}     warning: {warning}{reset}");
        }
    }
}

fn print_verify_summary(result: &VerifyResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("checked {} completed download(s)", result.checked);
    for entry in &result.entries {
        if entry.passed {
            println!("{green}  ok {} {}{reset}", entry.key, entry.file);
        } else {
            println!("{red}  failed {} {}{reset}", entry.key, entry.file);
            for failure in &entry.failures {
                println!("{red}     {failure}{reset}");
            }
        }
        for warning in &entry.warnings {
            println!("{yellow}     warning: {warning}{reset}");
        }
    }
    if !result.demoted.is_empty() {
        println!("{red}demoted to failed: {}{reset}", result.demoted.join(", "));
    }
}

fn print_status_summary(result: &StatusResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!(
        "pending {} / in progress {} / completed {} / failed {}",
        result.counts.pending,
        result.counts.in_progress,
        result.counts.completed,
        result.counts.failed
    );
    for task in &result.tasks {
        let color = match task.status {
            TaskState::Completed => green,
            TaskState::Failed => red,
            _ => yellow,
        };
        println!(
            "{color}  {} {} attempts={} {}{reset}",
            task.key,
            task.status,
            task.attempts,
            task.file.as_deref().unwrap_or("-")
        );
        if let Some(error) = &task.error {
            println!("{color}     {error}{reset}");
        }
    }
}

fn print_clean_summary(result: &CleanResult) {
    println!("removed {} staging entr(ies)", result.removed);
}

fn print_merge_summary(result: &MergeOutcome) {
    println!(
        "\x1b[32mmerged {} file(s) -> {} ({} records, variables: {})\x1b[0m",
        result.files,
        result.output,
        result.records,
        result.variables.join(", ")
    );
}
