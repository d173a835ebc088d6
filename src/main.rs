use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use multistream_recorder_lib::capture::FfmpegCapture;
use multistream_recorder_lib::config::{ConfigError, SourceSettings};
use multistream_recorder_lib::recorder::ProgressRegistry;
use multistream_recorder_lib::resolution::FfprobeProbe;
use multistream_recorder_lib::source::{
    parse_handle_list, CommandResolver, DirectResolver, SourceResolver,
};
use multistream_recorder_lib::utils::format::{format_hms, format_megabytes};
use multistream_recorder_lib::{
    ConfigStore, Orchestrator, RecordingMode, RunConfig, SourceDescriptor, WorkerState,
};

/// How often the live status is logged
const DASHBOARD_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ModeArg {
    /// Record sources that are live now; fail the others
    Manual,
    /// Wait for sources to go live, then record
    Automatic,
}

impl From<ModeArg> for RecordingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Manual => RecordingMode::Manual,
            ModeArg::Automatic => RecordingMode::Automatic,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "multistream-recorder",
    version,
    about = "Record many live streams at once, restarting captures when the resolution changes"
)]
struct Cli {
    /// User handle to record (repeatable)
    #[arg(long = "user", value_name = "HANDLE")]
    users: Vec<String>,

    /// Room id to record (repeatable)
    #[arg(long = "room-id", value_name = "ID")]
    rooms: Vec<String>,

    /// Live page or playback URL to record (repeatable)
    #[arg(long = "url", value_name = "URL")]
    urls: Vec<String>,

    /// File with one handle per line
    #[arg(long, value_name = "PATH")]
    users_file: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ModeArg::Manual)]
    mode: ModeArg,

    /// Seconds between liveness checks in automatic mode
    #[arg(long, default_value_t = 300, value_name = "SECS")]
    poll_interval: u64,

    /// Stop each source after this many seconds of recording
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,

    /// Directory recordings are written to
    #[arg(long, default_value = ".", value_name = "DIR")]
    output: PathBuf,

    /// Settings document
    #[arg(long, default_value = "config/user_settings.json", value_name = "PATH")]
    config: PathBuf,

    /// Helper program that resolves sources to playback URLs
    #[arg(long, value_name = "PROGRAM")]
    resolver: Option<String>,

    /// Argument passed to the resolver helper before the source (repeatable)
    #[arg(long = "resolver-arg", value_name = "ARG", requires = "resolver", allow_hyphen_values = true)]
    resolver_args: Vec<String>,

    /// Refuse runs that mix handles, rooms and URLs
    #[arg(long)]
    exclusive_kinds: bool,

    /// Save "restart on resolution change" for the given sources
    #[arg(long, conflicts_with = "disable_resolution_restart")]
    enable_resolution_restart: bool,

    /// Save "do not restart on resolution change" for the given sources
    #[arg(long)]
    disable_resolution_restart: bool,

    /// Save a resolution check interval for the given sources
    #[arg(long, value_name = "SECS")]
    resolution_check_interval: Option<u64>,
}

impl Cli {
    fn sources(&self) -> anyhow::Result<Vec<SourceDescriptor>> {
        let mut sources: Vec<SourceDescriptor> = Vec::new();
        sources.extend(self.users.iter().map(SourceDescriptor::handle));
        sources.extend(self.rooms.iter().map(SourceDescriptor::room));
        sources.extend(self.urls.iter().map(SourceDescriptor::url));

        if let Some(path) = &self.users_file {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading users file {}", path.display()))?;
            sources.extend(parse_handle_list(&text));
        }

        if sources.is_empty() {
            bail!("nothing to record; pass --user, --room-id, --url or --users-file");
        }
        Ok(sources)
    }

    fn run_config(&self) -> RunConfig {
        RunConfig {
            mode: self.mode.into(),
            poll_interval: Duration::from_secs(self.poll_interval),
            max_duration: self.duration.map(Duration::from_secs),
            output_directory: self.output.clone(),
            exclusive_kinds: self.exclusive_kinds,
            ..RunConfig::default()
        }
    }

    /// Settings given on the command line, to be saved per source
    fn settings_patch(&self) -> SourceSettings {
        let restart = if self.enable_resolution_restart {
            Some(true)
        } else if self.disable_resolution_restart {
            Some(false)
        } else {
            None
        };

        SourceSettings {
            restart_on_resolution_change: restart,
            resolution_check_interval: self.resolution_check_interval,
            ..SourceSettings::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    multistream_recorder_lib::init_tracing();

    let cli = Cli::parse();
    let sources = cli.sources()?;

    let mut store = ConfigStore::load(&cli.config, cli.run_config())
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;

    let patch = cli.settings_patch();
    if !patch.is_empty() {
        for source in &sources {
            match store.set_override(source, &patch) {
                Ok(()) => {}
                Err(ConfigError::NoSection(_)) => {
                    tracing::warn!("{} has no settings section; not saving settings for it", source);
                }
                Err(e) => return Err(e).context("updating settings"),
            }
        }
        store.save().context("saving settings")?;
    }

    let probe = Arc::new(FfprobeProbe::new());
    if !probe.is_available().await {
        tracing::warn!("ffprobe not found; restarting on resolution change is disabled");
        store.disable_resolution_restarts();
    }

    let resolver: Arc<dyn SourceResolver> = match &cli.resolver {
        Some(program) => {
            Arc::new(CommandResolver::new(program.as_str()).with_args(cli.resolver_args.clone()))
        }
        None => Arc::new(DirectResolver),
    };

    let orchestrator = Orchestrator::new(resolver, Arc::new(FfmpegCapture::new()), probe);
    let mut run = match orchestrator.start(sources, &store) {
        Ok(run) => run,
        Err(e) => {
            tracing::error!("[{}] {}", e.code(), e);
            return Err(e).context("starting run");
        }
    };
    tracing::info!("Run {} recording {}", run.id(), run.keys().join(", "));

    let stop = run.stop_signal();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if stop.trigger() {
                tracing::info!("Interrupted, stopping all sources");
            }
        }
    });

    let registry = run.registry();
    let dashboard = tokio::spawn(async move {
        let mut tick = tokio::time::interval(DASHBOARD_INTERVAL);
        tick.tick().await;
        loop {
            tick.tick().await;
            log_dashboard(&registry);
        }
    });

    let results = run.await_completion().await;
    dashboard.abort();

    println!();
    for result in &results {
        println!(
            "{:<24} {:<10} {:>3} segment(s) {:>10} {:>10}  {}",
            result.key,
            result.state,
            result.total_segments,
            format_hms(result.total_duration),
            format_megabytes(result.total_bytes),
            result.reason
        );
    }
    println!();
    println!("{}", run.summary());

    if results.iter().any(|result| result.state == WorkerState::Failed) {
        std::process::exit(1);
    }
    Ok(())
}

fn log_dashboard(registry: &ProgressRegistry) {
    for (key, progress) in registry.snapshot() {
        match progress.state {
            WorkerState::Recording => tracing::info!(
                "{} recording {} / {} (segment {}, total {})",
                key,
                format_hms(progress.segment_duration),
                format_megabytes(progress.segment_bytes),
                progress.segment_count,
                format_megabytes(progress.total_bytes + progress.segment_bytes)
            ),
            state => tracing::info!(
                "{} {} ({} segment(s), {}){}",
                key,
                state,
                progress.segment_count,
                format_megabytes(progress.total_bytes),
                progress
                    .last_error
                    .map(|e| format!(" last error: {}", e))
                    .unwrap_or_default()
            ),
        }
    }

    let summary = registry.summary();
    tracing::info!(
        "{} recording, {} waiting, {} completed, {} failed, {} stopped",
        summary.recording,
        summary.waiting,
        summary.completed,
        summary.failed,
        summary.stopped
    );
}
