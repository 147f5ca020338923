//! Toolview CLI - inspect toolpaths and watch job progress
//!
//! Usage:
//!   toolview parse <FILE>
//!   toolview watch <JOB_ID> [--config <PATH>] [--api <URL>]
//!   toolview download <JOB_ID> [-o <FILE>]
//!
//! Example:
//!   toolview parse demo/bracket.nc
//!   toolview watch 42 --api http://localhost:8000 -v

use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::path::{Path, PathBuf};
use toolview::job::{ArtefactKind, JobId};
use toolview::toolpath::{self, MoveKind};
use toolview::{
    HttpJobApi, JobApi, ParseResult, StreamPhase, ToolpathState, Unit, ViewState, ViewerConfig,
    ViewerOrchestrator,
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn print_usage() {
    eprintln!(
        r#"
{} - Inspect toolpaths and watch machining jobs

{}
    toolview parse <FILE>
    toolview watch <JOB_ID> [OPTIONS]
    toolview download <JOB_ID> [-o <FILE>] [OPTIONS]

{}
    parse       Interpret a local toolpath file and print a summary
    watch       Follow a job: snapshot, toolpath, live progress
    download    Save the job's toolpath text (default: job-<ID>.nc)

{}
    -c, --config <PATH>    TOML config file (default: built-in defaults)
    -a, --api <URL>        Job backend base URL (overrides config and env)
    -o, --output <FILE>    Output file for download
    -v, --verbose          Log progress of fetches and streams
    -vv                    Debug logging
    -h, --help             Print this help message

{}
    TOOLVIEW_API_BASE_URL      Job backend base URL
    TOOLVIEW_MACHINE_BOUNDS    Machine envelope, e.g. {{"x":[0,300],"y":[0,300],"z":[-50,150]}}
    RUST_LOG                   Log filter, overrides -v
"#,
        "Toolview".bold(),
        "USAGE:".bold(),
        "COMMANDS:".bold(),
        "OPTIONS:".bold(),
        "ENVIRONMENT:".bold(),
    );
}

enum Command {
    Parse(PathBuf),
    Watch(JobId),
    Download(JobId),
}

struct CliArgs {
    command: Command,
    config_path: Option<PathBuf>,
    api_url: Option<String>,
    output: Option<PathBuf>,
    verbose: u8, // 0=warn, 1=info, 2=debug
}

fn parse_args() -> Result<CliArgs> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        std::process::exit(if args.iter().any(|a| a == "--help" || a == "-h") {
            0
        } else {
            1
        });
    }

    let command = match args[1].as_str() {
        "parse" => Command::Parse(PathBuf::from(&args[2])),
        "watch" => Command::Watch(parse_job_id(&args[2])?),
        "download" => Command::Download(parse_job_id(&args[2])?),
        other => bail!("Unknown command: {}", other),
    };

    let mut config_path = None;
    let mut api_url = None;
    let mut output = None;
    let mut verbose: u8 = 0;

    let mut i = 3;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = Some(PathBuf::from(&args[i]));
                }
            }
            "--api" | "-a" => {
                i += 1;
                if i < args.len() {
                    api_url = Some(args[i].clone());
                }
            }
            "--output" | "-o" => {
                i += 1;
                if i < args.len() {
                    output = Some(PathBuf::from(&args[i]));
                }
            }
            "--verbose" | "-v" => {
                verbose = verbose.max(1);
            }
            "-vv" => {
                verbose = 2;
            }
            other => {
                eprintln!("{} ignoring unknown option {}", "warning:".yellow(), other);
            }
        }
        i += 1;
    }

    Ok(CliArgs {
        command,
        config_path,
        api_url,
        output,
        verbose,
    })
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    raw.parse()
        .with_context(|| format!("Invalid job id: {}", raw))
}

fn load_config(args: &CliArgs) -> Result<ViewerConfig> {
    let mut config = match &args.config_path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            ViewerConfig::from_toml_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        }
        None => ViewerConfig::default(),
    };

    config.apply_env(|key| std::env::var(key).ok());
    if let Some(url) = &args.api_url {
        config.api_base_url = url.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    // RUST_LOG wins over -v
    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&args)?;

    match args.command {
        Command::Parse(ref path) => run_parse(path, &config),
        Command::Watch(job_id) => run_watch(job_id, &config).await,
        Command::Download(job_id) => run_download(job_id, args.output.clone(), &config).await,
    }
}

fn run_parse(path: &Path, config: &ViewerConfig) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read toolpath file: {}", path.display()))?;
    let result = toolpath::parse(&text);

    println!("{} {}", "File:".dimmed(), path.display());
    print_summary(&result, config);
    Ok(())
}

fn print_summary(result: &ParseResult, config: &ViewerConfig) {
    let unit = match result.unit {
        Unit::Unknown => "unknown (no unit directive)".yellow().to_string(),
        unit => unit.to_string().green().to_string(),
    };
    println!("{} {}", "Units:".dimmed(), unit);
    println!("{} {}", "Moves:".dimmed(), result.moves.len());

    for kind in [MoveKind::Rapid, MoveKind::Feed] {
        let lines: Vec<_> = result.polylines_of(kind).collect();
        let points: usize = lines.iter().map(|p| p.points.len()).sum();
        let length: f64 = lines.iter().map(|p| p.length()).sum();
        println!(
            "{} {} polylines, {} points, {:.3} path length",
            format!("{:>6}:", kind.to_string()).dimmed(),
            lines.len(),
            points,
            length
        );
    }

    let stats = result.feed_stats();
    match (stats.min, stats.max, stats.mean) {
        (Some(min), Some(max), Some(mean)) => println!(
            "{} {} values, min {:.1}, max {:.1}, mean {:.1}",
            "Feeds:".dimmed(),
            stats.count,
            min,
            max,
            mean
        ),
        _ => println!("{} none", "Feeds:".dimmed()),
    }
    if stats.has_zero_feed() {
        println!(
            "{} {} feed moves run at zero feed",
            "warning:".yellow(),
            stats.near_zero
        );
    }
    if !result.feed_declared {
        println!("{} feed moves present but no feed rate set", "warning:".yellow());
    }

    match result.extent() {
        Some(extent) => {
            println!(
                "{} [{:.2}, {:.2}, {:.2}] .. [{:.2}, {:.2}, {:.2}]",
                "Extent:".dimmed(),
                extent.min[0],
                extent.min[1],
                extent.min[2],
                extent.max[0],
                extent.max[1],
                extent.max[2]
            );
            if config.machine_bounds.contains(&extent) {
                println!("{} within machine bounds", "Bounds:".dimmed());
            } else {
                println!(
                    "{} toolpath exceeds machine bounds {:?}/{:?}/{:?}",
                    "warning:".yellow(),
                    config.machine_bounds.x,
                    config.machine_bounds.y,
                    config.machine_bounds.z
                );
            }
        }
        None => println!("{} empty", "Extent:".dimmed()),
    }
}

/// Fields worth printing when they change
#[derive(Debug, PartialEq)]
struct Headline {
    status: Option<String>,
    toolpath: String,
    progress: String,
    stream: StreamPhase,
    error: Option<String>,
}

impl Headline {
    fn of(state: &ViewState) -> Self {
        let toolpath = match &state.toolpath {
            ToolpathState::Pending => "pending".to_string(),
            ToolpathState::NotProduced => "not produced yet".to_string(),
            ToolpathState::Loaded(result) => {
                format!("{} polylines ({})", result.polylines.len(), result.unit)
            }
            ToolpathState::Failed(cause) => format!("failed: {}", cause),
        };
        Self {
            status: state.job.as_ref().map(|j| j.status.to_string()),
            toolpath,
            progress: format!("{:.0}% {}", state.progress, state.progress_message),
            stream: state.stream,
            error: state.error.clone(),
        }
    }
}

async fn run_watch(job_id: JobId, config: &ViewerConfig) -> Result<()> {
    let api = HttpJobApi::from_config(config);
    api.fetch_job(job_id)
        .await
        .with_context(|| format!("Cannot watch job {}", job_id))?;

    let mut viewer = ViewerOrchestrator::from_config(config);
    viewer.open(job_id);
    let mut rx = viewer.watch();
    let mut last = None;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let state = rx.borrow_and_update().clone();
        let current = Headline::of(&state);
        if last.as_ref() != Some(&current) {
            print_state(job_id, &state, &current);
            last = Some(current);
        }

        let stream_open = matches!(state.stream, StreamPhase::Connecting | StreamPhase::Live);
        if state.is_settled() && state.toolpath != ToolpathState::Pending && !stream_open {
            break;
        }

        tokio::select! {
            _ = &mut ctrl_c => {
                eprintln!("{}", "interrupted".dimmed());
                break;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    viewer.close();
    Ok(())
}

fn print_state(job_id: JobId, state: &ViewState, headline: &Headline) {
    let stream = match headline.stream {
        StreamPhase::Live => headline.stream.to_string().green(),
        StreamPhase::Disconnected => headline.stream.to_string().yellow(),
        _ => headline.stream.to_string().dimmed(),
    };
    println!(
        "{} {} {} {} {} {} {} {} {}",
        format!("job #{}", job_id).bold(),
        "status:".dimmed(),
        headline.status.as_deref().unwrap_or("-"),
        "toolpath:".dimmed(),
        headline.toolpath,
        "progress:".dimmed(),
        headline.progress.trim_end(),
        "stream:".dimmed(),
        stream
    );
    if let Some(error) = &headline.error {
        println!("  {} {}", "error:".red(), error);
    }
    if state.actions.view_simulation {
        println!("  {}", "simulation mesh available".cyan());
    }
}

async fn run_download(job_id: JobId, output: Option<PathBuf>, config: &ViewerConfig) -> Result<()> {
    let api = HttpJobApi::from_config(config);
    let job = api
        .fetch_job(job_id)
        .await
        .with_context(|| format!("Failed to fetch job {}", job_id))?;

    let Some(artefact) = job.resolve(ArtefactKind::ToolpathText) else {
        bail!("Job {} has no toolpath yet (status: {})", job_id, job.status);
    };

    let text = api
        .fetch_text(artefact)
        .await
        .context("Failed to download toolpath, the signed URL may have expired")?;

    let path = output.unwrap_or_else(|| PathBuf::from(format!("job-{}.nc", job_id)));
    std::fs::write(&path, &text)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!(
        "{} {} ({} bytes)",
        "Saved".green(),
        path.display(),
        text.len()
    );
    Ok(())
}
