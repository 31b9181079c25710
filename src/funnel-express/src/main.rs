//! Funnel Express: evaluates conversion funnels over batches of visits.
//!
//! Command-line front end over the matching and reporting crates.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use funnel_core::config::{AppConfig, LoggingConfig};
use funnel_core::types::{InteractionEvent, ReportPeriod, Visit};
use funnel_matching::{validate_steps, ConditionMatcher};
use funnel_reporting::{
    FunnelArchiver, FunnelDefinition, FunnelEvaluator, FunnelStore, InMemoryEventSource,
    InMemoryFunnelStore, InMemoryMetricsSink,
};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "funnel-express")]
#[command(about = "Conversion funnel evaluation over visit batches")]
#[command(version)]
struct Cli {
    /// TOML config file
    #[arg(long, global = true, env = "FUNNEL_EXPRESS_CONFIG")]
    config: Option<PathBuf>,

    /// Evaluator worker threads (overrides config)
    #[arg(long, global = true, env = "FUNNEL_EXPRESS__EVALUATOR__NUM_THREADS")]
    threads: Option<usize>,

    /// Human-readable logs instead of JSON
    #[arg(long, global = true, default_value_t = false)]
    plain_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate a funnel over a JSON array of visits and print the snapshot
    Evaluate {
        #[arg(long)]
        funnel: PathBuf,
        #[arg(long)]
        events: PathBuf,
        /// `YYYY-MM-DD` or `YYYY-MM-DD,YYYY-MM-DD`; defaults to the span of the events
        #[arg(long)]
        period: Option<ReportPeriod>,
    },
    /// Report steps whose conditions can never match
    Validate {
        #[arg(long)]
        funnel: PathBuf,
    },
    /// Show which steps a page view of the URL would match
    TestUrl {
        #[arg(long)]
        funnel: PathBuf,
        #[arg(long)]
        url: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loaded = AppConfig::load(cli.config.as_deref());
    let mut config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => AppConfig::default(),
    };
    if cli.plain_logs {
        config.logging.json = false;
    }
    init_tracing(&config.logging);

    if let Err(e) = loaded {
        warn!(error = %e, "Failed to load config, using defaults");
    }
    if let Some(threads) = cli.threads {
        config.evaluator.num_threads = threads;
    }

    match cli.command {
        Command::Evaluate {
            funnel,
            events,
            period,
        } => evaluate(&config, &funnel, &events, period),
        Command::Validate { funnel } => validate(&funnel),
        Command::TestUrl { funnel, url } => test_url(&funnel, &url),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.filter.as_str().into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn evaluate(
    config: &AppConfig,
    funnel_path: &Path,
    events_path: &Path,
    period: Option<ReportPeriod>,
) -> anyhow::Result<()> {
    let definition: FunnelDefinition = read_json(funnel_path)?;
    let visits: Vec<Visit> = read_json(events_path)?;
    let period = period.unwrap_or_else(|| span_of(&visits));

    info!(
        funnel_id = %definition.id,
        steps = definition.steps.len(),
        visits = visits.len(),
        %period,
        "Evaluating funnel"
    );

    let store = Arc::new(InMemoryFunnelStore::new());
    let source = Arc::new(InMemoryEventSource::new());
    let evaluator = FunnelEvaluator::new(config.evaluator.clone())?;
    let archiver = FunnelArchiver::new(
        store.clone(),
        source.clone(),
        Arc::new(InMemoryMetricsSink::new()),
        Arc::new(evaluator),
    )
    .with_retention(config.retention.clone());

    let (site_id, funnel_id) = (definition.site_id, definition.id);
    store.save(definition);
    source.add_visits(site_id, visits);

    let Some(snapshot) = archiver.archive_funnel(site_id, &funnel_id, &period)? else {
        bail!("funnel {} is inactive", funnel_id);
    };
    println!("{}", snapshot.to_json()?);
    Ok(())
}

/// Smallest period covering every event, or today when there are none.
fn span_of(visits: &[Visit]) -> ReportPeriod {
    let mut days = visits
        .iter()
        .flat_map(|v| v.events.iter())
        .map(|e| e.timestamp.date_naive());
    let Some(first) = days.next() else {
        return ReportPeriod::day(Utc::now().date_naive());
    };
    let (start, end) = days.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d)));
    ReportPeriod { start, end }
}

fn validate(funnel_path: &Path) -> anyhow::Result<()> {
    let definition: FunnelDefinition = read_json(funnel_path)?;

    let mut problems = 0;
    if let Err(e) = definition.ensure_has_steps() {
        println!("{}", e);
        problems += 1;
    }
    for issue in validate_steps(&definition.steps) {
        println!("{}", issue);
        problems += 1;
    }

    if problems > 0 {
        std::process::exit(1);
    }
    println!("funnel {} is valid", definition.id);
    Ok(())
}

fn test_url(funnel_path: &Path, url: &str) -> anyhow::Result<()> {
    let definition: FunnelDefinition = read_json(funnel_path)?;
    let event = InteractionEvent::page_view(url, Utc::now());

    let matched = ConditionMatcher::new().matching_steps(&definition.steps, &event);
    if matched.is_empty() {
        println!("no step matches {}", url);
    }
    for index in matched {
        println!("step {}: {}", index, definition.steps[index].name);
    }
    Ok(())
}
