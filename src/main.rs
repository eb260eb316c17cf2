use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use key_checker::{
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    database::{history_summary, HistoryDatabase, HistoryRecord},
    new_session_id,
    tui::RunMonitorApp,
    BatchRunner, CheckError, CheckpointStore, ExportFormat, HttpMethod, HttpProbe, KeyParser,
    KeyRule, ProgressEvent, RequestConfig, ResultExporter, RunResults, RunStats,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing_subscriber::{fmt, EnvFilter};

/// Bulk bearer key checker with resumable progress
#[derive(Parser)]
#[command(name = "key-checker")]
#[command(about = "Bulk bearer key checker with bounded concurrency and resumable progress")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// History database file path (overrides the settings file)
    #[arg(short, long)]
    database: Option<String>,

    /// Log filter, e.g. "debug" (overrides RUST_LOG and the settings file)
    #[arg(long)]
    log_level: Option<String>,
}

/// Request settings that override the settings file
#[derive(Args, Default)]
struct RequestArgs {
    /// Endpoint each key is tested against
    #[arg(long)]
    endpoint: Option<String>,
    /// HTTP method (GET, POST, PUT, DELETE, PATCH)
    #[arg(short = 'X', long)]
    method: Option<String>,
    /// Extra headers as "Name: Value; Name: Value"
    #[arg(long)]
    headers: Option<String>,
    /// Request body for POST, PUT and PATCH
    #[arg(long)]
    body: Option<String>,
}

/// Where to write results once the run ends
#[derive(Args, Default)]
struct OutputArgs {
    /// Output file for valid keys
    #[arg(long)]
    valid: Option<PathBuf>,
    /// Output file for invalid keys, annotated with the reason
    #[arg(long)]
    invalid: Option<PathBuf>,
    /// Output file for every result
    #[arg(long)]
    all: Option<PathBuf>,
    /// Output file for every result as JSON
    #[arg(long)]
    json: Option<PathBuf>,
    /// Show the interactive progress view
    #[arg(long)]
    tui: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check keys from a file
    Check {
        /// Input file containing keys, one per line
        input: PathBuf,
        #[command(flatten)]
        request: RequestArgs,
        /// Number of concurrent probes
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
        /// Per-probe timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Seconds between checkpoint saves
        #[arg(long)]
        save_interval: Option<u64>,
        /// Do not write checkpoints
        #[arg(long)]
        no_checkpoint: bool,
        /// Required key prefix
        #[arg(long)]
        prefix: Option<String>,
        /// Minimum key length
        #[arg(long)]
        min_length: Option<usize>,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Resume an interrupted check from a checkpoint
    Resume {
        /// Checkpoint file; defaults to the newest one for --input
        checkpoint: Option<PathBuf>,
        /// Input file whose newest checkpoint should be resumed
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[command(flatten)]
        request: RequestArgs,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Extract keys from a file
    Parse {
        /// Input file
        input: PathBuf,
        /// Output file for parsed keys
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Required key prefix
        #[arg(long)]
        prefix: Option<String>,
        /// Minimum key length
        #[arg(long)]
        min_length: Option<usize>,
    },
    /// Inspect the run history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
    /// Inspect or create the settings file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// List all runs
    List {
        /// Only runs whose session, input file, endpoint or start time contain this text
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Show one run by ID
    Show { id: i64 },
    /// Delete one run by ID
    Delete { id: i64 },
    /// Delete all runs
    Clear,
    /// Write a text report of one run, or of every run
    Export {
        /// Run ID; every run when omitted
        id: Option<i64>,
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective settings
    Show,
    /// Write the default settings file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

/// What a run should do once the runner is built
enum Job {
    Fresh {
        keys: Vec<String>,
        source: String,
        session_id: String,
        checkpoint: Option<PathBuf>,
    },
    Resume(PathBuf),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;
    init_logging(&cli, &config);

    let database_url = cli
        .database
        .clone()
        .unwrap_or_else(|| config.database_url.clone());

    match cli.command {
        Commands::Check {
            input,
            request,
            concurrency,
            timeout,
            save_interval,
            no_checkpoint,
            prefix,
            min_length,
            output,
        } => {
            let rule = key_rule(&config, prefix, min_length);
            let keys = KeyParser::parse_file(&input, &rule)?;
            println!("Loaded {} keys from {:?}", keys.len(), input);
            if keys.is_empty() {
                bail!(
                    "no keys found in {:?} (prefix {:?}, minimum length {})",
                    input,
                    rule.prefix,
                    rule.min_length
                );
            }

            let timeout = timeout.unwrap_or(config.detection.timeout_secs);
            let request = request_config(&config, &request, timeout)?;
            let mut options = config.runner_options().with_timeout_secs(timeout);
            if let Some(concurrency) = concurrency {
                options = options.with_concurrency(concurrency);
            }
            if let Some(secs) = save_interval {
                options = options.with_save_interval(Duration::from_secs(secs.max(1)));
            }

            let checkpointing = config.progress.auto_save && !no_checkpoint;
            let session_id = new_session_id();
            let checkpoint = checkpointing.then(|| options.store.path_for(&session_id));

            println!(
                "Checking with {} concurrent probes, timeout: {}s",
                options.concurrency, timeout
            );
            println!("Endpoint: {} {}", request.method, request.endpoint);
            if let Some(path) = &checkpoint {
                println!("Checkpoint: {:?}", path);
            }
            println!();

            let source = input.display().to_string();
            let endpoint = request.endpoint.clone();
            let probe = Arc::new(HttpProbe::new(request)?);
            let runner = BatchRunner::new(probe, options);
            let total = keys.len();

            let results = execute(
                runner,
                Job::Fresh {
                    keys,
                    source: source.clone(),
                    session_id: session_id.clone(),
                    checkpoint: checkpoint.clone(),
                },
                total,
                None,
                output.tui,
            )
            .await?;

            finish_run(
                &config,
                &database_url,
                &session_id,
                &source,
                &endpoint,
                checkpoint.as_deref(),
                &results,
                &output,
                true,
            )
            .await?;
        }
        Commands::Resume {
            checkpoint,
            input,
            request,
            output,
        } => {
            let store = config.checkpoint_store();
            let path = match (checkpoint, input) {
                (Some(path), _) => path,
                (None, Some(input)) => {
                    let source = input.display().to_string();
                    store
                        .find_latest(&source)
                        .ok_or_else(|| anyhow!("no checkpoint found for {:?} in {:?}", input, store.dir()))?
                }
                (None, None) => bail!("give a checkpoint file or --input"),
            };

            let snapshot =
                CheckpointStore::load(&path).ok_or_else(|| CheckError::CheckpointLoad(path.clone()))?;
            let pending = snapshot.pending_keys().len();
            println!("Resuming {:?}", path);
            println!("Source: {}", snapshot.input_source_id);
            println!(
                "Total: {} | Completed: {} | Pending: {}",
                snapshot.all_keys.len(),
                snapshot.completed_results.len(),
                pending
            );
            println!("Last saved: {}", snapshot.last_save_time.to_rfc3339());
            println!();

            let request = request_config(&config, &request, snapshot.timeout_used)?;
            let endpoint = request.endpoint.clone();
            let probe = Arc::new(HttpProbe::new(request)?);
            let options = config
                .runner_options()
                .with_timeout_secs(snapshot.timeout_used);
            let runner = BatchRunner::new(probe, options);

            let results = execute(
                runner,
                Job::Resume(path.clone()),
                snapshot.all_keys.len(),
                Some(&snapshot.stats),
                output.tui && pending > 0,
            )
            .await?;

            finish_run(
                &config,
                &database_url,
                &snapshot.session_id,
                &snapshot.input_source_id,
                &endpoint,
                Some(&path),
                &results,
                &output,
                pending > 0,
            )
            .await?;
        }
        Commands::Parse {
            input,
            output,
            prefix,
            min_length,
        } => {
            let rule = key_rule(&config, prefix, min_length);
            let keys = KeyParser::parse_file(&input, &rule)?;

            println!("Parsed {} keys from {:?}", keys.len(), input);

            if let Some(output_path) = output {
                let mut content = keys.join("\n");
                if !content.is_empty() {
                    content.push('\n');
                }
                std::fs::write(&output_path, content)?;
                println!("Saved parsed keys to {:?}", output_path);
            } else {
                for key in &keys {
                    println!("{}", key);
                }
            }
        }
        Commands::History { action } => {
            let db = HistoryDatabase::new(&database_url).await?;
            match action {
                HistoryAction::List { filter } => {
                    let mut records = db.get_all_records().await?;
                    if let Some(filter) = &filter {
                        records.retain(|record| record.matches(filter));
                    }
                    if records.is_empty() {
                        println!("No runs recorded.");
                    }
                    for record in records {
                        println!(
                            "#{} {} {} - total {} | valid {} | invalid {} | error {} | {:.1}s",
                            record.id,
                            record.start_time.format("%Y-%m-%d %H:%M:%S"),
                            record.input_file,
                            record.total_keys,
                            record.valid_keys,
                            record.invalid_keys,
                            record.error_keys,
                            record.duration
                        );
                    }
                }
                HistoryAction::Show { id } => match db.get_record(id).await? {
                    Some(record) => print_record(&record),
                    None => eprintln!("Run not found: {}", id),
                },
                HistoryAction::Delete { id } => {
                    if db.delete_record(id).await? {
                        println!("Run deleted: {}", id);
                    } else {
                        eprintln!("Run not found: {}", id);
                    }
                }
                HistoryAction::Clear => {
                    let removed = db.clear().await?;
                    println!("Deleted {} runs", removed);
                }
                HistoryAction::Export { id, output } => {
                    let report = match id {
                        Some(id) => db
                            .get_record(id)
                            .await?
                            .ok_or_else(|| anyhow!("run not found: {}", id))?
                            .report(),
                        None => history_summary(&db.get_all_records().await?),
                    };
                    std::fs::write(&output, report)?;
                    println!("Saved history report to {:?}", output);
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Init { force } => {
                if cli.config.exists() && !force {
                    bail!("{:?} already exists, use --force to overwrite", cli.config);
                }
                AppConfig::default().save(&cli.config)?;
                println!("Wrote default settings to {:?}", cli.config);
            }
        },
    }

    Ok(())
}

fn init_logging(cli: &Cli, config: &AppConfig) {
    let drawing = matches!(
        &cli.command,
        Commands::Check { output, .. } | Commands::Resume { output, .. } if output.tui
    );

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        // Log lines would tear the progress view
        None if drawing => EnvFilter::new("off"),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn key_rule(config: &AppConfig, prefix: Option<String>, min_length: Option<usize>) -> KeyRule {
    let mut rule = config.key_rule();
    if let Some(prefix) = prefix {
        rule.prefix = prefix;
    }
    if let Some(min_length) = min_length {
        rule.min_length = min_length;
    }
    rule
}

fn request_config(config: &AppConfig, args: &RequestArgs, timeout_secs: u64) -> Result<RequestConfig> {
    let mut request = config
        .request_config()
        .with_timeout(Duration::from_secs(timeout_secs));

    if let Some(endpoint) = &args.endpoint {
        request = request.with_endpoint(endpoint.clone());
    }
    if let Some(method) = &args.method {
        request = request.with_method(method.parse::<HttpMethod>()?);
    }
    if let Some(headers) = &args.headers {
        request = request.with_headers(headers.clone());
    }
    if let Some(body) = &args.body {
        request = request.with_body(body.clone());
    }

    Ok(request)
}

/// Drive one run to completion, showing progress and honouring Ctrl-C
async fn execute(
    runner: BatchRunner,
    job: Job,
    total: usize,
    resumed: Option<&RunStats>,
    tui: bool,
) -> Result<RunResults> {
    let (tx, rx) = unbounded_channel();
    let runner = Arc::new(runner.with_progress(tx));
    let stop = runner.stop_handle();

    let ctrl_c_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping: waiting for in-flight probes to finish...");
            ctrl_c_stop.request_stop();
        }
    });

    let task = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move {
            match job {
                Job::Fresh {
                    keys,
                    source,
                    session_id,
                    checkpoint: Some(path),
                } => {
                    runner
                        .run_with_checkpoint_at(keys, &source, session_id, path)
                        .await
                }
                Job::Fresh { keys, .. } => runner.run(keys).await,
                Job::Resume(path) => runner.resume(&path).await,
            }
        })
    };
    // The progress channel closes once the task drops the last runner handle
    drop(runner);

    if tui {
        let mut app = RunMonitorApp::new("🔑 Key Checker", total, rx, stop);
        if let Some(stats) = resumed {
            app = app.with_counts(stats);
        }
        app.run().await?;
    } else {
        print_progress(rx, total).await;
    }

    let results = task.await??;
    Ok(results)
}

/// Print a progress line roughly every percent
async fn print_progress(mut rx: UnboundedReceiver<ProgressEvent>, total: usize) {
    let step = (total / 100).max(1);
    let mut printed = false;
    while let Some(event) = rx.recv().await {
        if event.checked % step == 0 || event.checked == event.total {
            println!(
                "Checked {}/{} | Valid: {} | Invalid: {} | Error: {}",
                event.checked, event.total, event.valid, event.invalid, event.error
            );
            printed = true;
        }
    }
    if printed {
        println!();
    }
}

#[allow(clippy::too_many_arguments)]
async fn finish_run(
    config: &AppConfig,
    database_url: &str,
    session_id: &str,
    source: &str,
    endpoint: &str,
    checkpoint: Option<&Path>,
    results: &RunResults,
    output: &OutputArgs,
    probed: bool,
) -> Result<()> {
    let stats = &results.stats;
    println!(
        "Results: {} valid, {} invalid, {} error ({} of {} checked)",
        stats.valid, stats.invalid, stats.error, stats.checked, stats.total
    );
    println!(
        "Duration: {:.2}s | Speed: {:.1} keys/s",
        stats.duration_secs, stats.avg_speed
    );

    let exports = [
        (&output.valid, ExportFormat::Valid, "valid keys"),
        (&output.invalid, ExportFormat::Invalid, "invalid keys"),
        (&output.all, ExportFormat::All, "results"),
        (&output.json, ExportFormat::Json, "results as JSON"),
    ];
    for (path, format, what) in exports {
        if let Some(path) = path {
            let count = ResultExporter::save_to_file(results, format, path)?;
            println!("Saved {} {} to {:?}", count, what, path);
        }
    }

    if !results.valid_keys.is_empty() && output.valid.is_none() {
        println!("\nValid keys:");
        for result in &results.valid_keys {
            match result.response_time_ms {
                Some(time) => println!("  {} ({}ms)", result.key, time),
                None => println!("  {}", result.key),
            }
        }
    }

    if stats.checked < stats.total {
        if let Some(path) = checkpoint {
            println!(
                "\n{} keys not checked. Resume with: key-checker resume {:?}",
                stats.remaining(),
                path
            );
        }
    } else if checkpoint.is_some() {
        let store = config.checkpoint_store();
        match store.prune(source, config.progress.max_progress_files) {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "pruned old checkpoints"),
            Err(e) => tracing::warn!(error = %e, "failed to prune checkpoints"),
        }
    }

    // One row per finished session; stopped runs are recorded by the resume that completes them
    if !probed || stats.checked < stats.total {
        return Ok(());
    }

    // History is a convenience; a failure here must not lose the results above
    let record = HistoryRecord::from_results(session_id, source, endpoint, results);
    match HistoryDatabase::new(database_url).await {
        Ok(db) => {
            if let Err(e) = db.add_record(&record).await {
                tracing::warn!(error = %e, "failed to record run history");
            }
        }
        Err(e) => tracing::warn!(error = %e, "cannot open history database"),
    }

    Ok(())
}

fn print_record(record: &HistoryRecord) {
    println!("Run #{}", record.id);
    println!("  Session:   {}", record.session_id);
    println!("  Input:     {}", record.input_file);
    println!("  Endpoint:  {}", record.api_endpoint);
    println!("  Started:   {}", record.start_time.to_rfc3339());
    println!("  Finished:  {}", record.end_time.to_rfc3339());
    println!("  Total:     {}", record.total_keys);
    println!("  Valid:     {}", record.valid_keys);
    println!("  Invalid:   {}", record.invalid_keys);
    println!("  Error:     {}", record.error_keys);
    println!("  Duration:  {:.2}s", record.duration);
    println!("  Speed:     {:.1} keys/s", record.avg_speed);
}
