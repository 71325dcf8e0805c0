//! Command-line interface for the optimizer.

use sieve::analytics::StandardMetrics;
use sieve::config::{load_config, SieveFileConfig};
use sieve::coverage::schedule;
use sieve::data::load_csv;
use sieve::error::{OptimizeError, Result};
use sieve::export::{export_json, export_stitched_csv, export_trials_csv, RunRecord, WalkForwardRecord};
use sieve::journal::TrialJournal;
use sieve::metadata::RunMetadata;
use sieve::orchestrator::{RunContext, TrialOrchestrator};
use sieve::postprocess::{split_holdout, PostProcessChain, PostProcessReport};
use sieve::simulator::{Backtester, SmaCrossSimulator};
use sieve::space::format_params;
use sieve::study::OptimizationRun;
use sieve::types::Bar;
use sieve::walkforward::{WalkForwardAnalyzer, WalkForwardResult};

use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{builder::Builder, settings::Style};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Sieve - walk-forward parameter optimization for trading strategies.
#[derive(Parser)]
#[command(name = "sieve")]
#[command(version)]
#[command(about = "Walk-forward parameter optimization with post-process validation")]
#[command(long_about = None)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Optimize once over the whole data range, then run the post-process chain
    Optimize {
        /// Run configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Data file; overrides `[data] path`
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Override the trial budget
        #[arg(short = 'n', long)]
        trials: Option<usize>,

        /// Override the worker count
        #[arg(short, long)]
        workers: Option<usize>,

        /// Persist trials to a JSON-lines journal
        #[arg(long)]
        journal: Option<PathBuf>,

        /// Ranked trials to print
        #[arg(long, default_value = "10")]
        top: usize,

        /// Directory for run.json and trials.csv
        #[arg(long)]
        out: Option<PathBuf>,

        /// Show a progress bar
        #[arg(long)]
        progress: bool,
    },

    /// Rolling walk-forward analysis
    Walkforward {
        /// Run configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Data file; overrides `[data] path`
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Directory for walkforward.json and stitched.csv
        #[arg(long)]
        out: Option<PathBuf>,

        /// Show a progress bar per window
        #[arg(long)]
        progress: bool,
    },

    /// Print the coverage schedule for a search space
    Coverage {
        /// Run configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Override the number of coverage trials
        #[arg(short = 'n', long)]
        trials: Option<usize>,
    },

    /// Write an example configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "sieve.toml")]
        output: PathBuf,
    },
}

impl Cli {
    /// Initialize logging based on verbosity level.
    pub fn init_logging(&self) {
        let level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };

        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .finish();

        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Failed to set tracing subscriber: {}", e);
        }
    }
}

/// Run the CLI application.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    match &cli.command {
        Commands::Optimize {
            config,
            data,
            trials,
            workers,
            journal,
            top,
            out,
            progress,
        } => {
            let mut config = load_config(config)?;
            if let Some(n) = trials {
                config.optimization.max_trials = Some(*n);
            }
            if let Some(n) = workers {
                config.optimization.workers = *n;
            }
            config.validate()?;
            run_optimize(&config, data.as_deref(), journal.as_deref(), *top, out.as_deref(), *progress)
        }

        Commands::Walkforward {
            config,
            data,
            out,
            progress,
        } => {
            let config = load_config(config)?;
            run_walkforward(&config, data.as_deref(), out.as_deref(), *progress)
        }

        Commands::Coverage { config, trials } => {
            let config = load_config(config)?;
            print_coverage(&config, *trials);
            Ok(())
        }

        Commands::Init { output } => {
            fs::write(output, SieveFileConfig::example())?;
            println!("Wrote example configuration to {}", output.display());
            Ok(())
        }
    }
}

fn backtester(config: &SieveFileConfig) -> Backtester {
    let settings = &config.simulator;
    let simulator = SmaCrossSimulator::new(settings.initial_balance).with_commission(settings.commission_rate);
    let metrics = StandardMetrics::default().with_annualization(settings.annualization_factor);
    Backtester::new(Arc::new(simulator), Arc::new(metrics), settings.initial_balance)
}

fn load_bars(config: &SieveFileConfig, data: Option<&Path>) -> Result<(PathBuf, Vec<Bar>)> {
    let path = match (data, &config.data.path) {
        (Some(p), _) => p.to_path_buf(),
        (None, Some(p)) => PathBuf::from(p),
        (None, None) => {
            return Err(OptimizeError::ConfigError(
                "no data file: pass --data or set [data] path".to_string(),
            ))
        }
    };
    info!("Loading data from: {}", path.display());
    let bars = load_csv(&path, &config.data.csv_config())?;
    let bars = config.data.slice(&bars)?.to_vec();
    info!("Using {} bars", bars.len());
    Ok((path, bars))
}

fn run_optimize(
    config: &SieveFileConfig,
    data: Option<&Path>,
    journal_path: Option<&Path>,
    top: usize,
    out: Option<&Path>,
    progress: bool,
) -> Result<()> {
    let (path, bars) = load_bars(config, data)?;
    let backtester = backtester(config);
    let optimizer = config.optimization.to_orchestrator_config();
    let periods = split_holdout(&bars, optimizer.warmup_bars, &config.postprocess)?;
    let ctx = RunContext::new().with_progress(progress);

    let orchestrator = TrialOrchestrator::new(
        config.search.clone(),
        optimizer.with_warmup(periods.optimize.warmup()),
        backtester.clone(),
    );
    let run = match journal_path {
        Some(p) => {
            let journal = if p.exists() {
                TrialJournal::open(p)?
            } else {
                TrialJournal::create(p)?
            };
            let run = orchestrator.run_with_journal(periods.optimize.bars(), &ctx, &journal)?;
            if run.cancelled {
                warn!("Run cancelled, discarding journal {}", p.display());
                journal.discard()?;
            }
            run
        }
        None => orchestrator.run(periods.optimize.bars(), &ctx)?,
    };

    println!("\n{}", run.summary());
    print_trials(&run, top);

    let report = if config.postprocess.is_enabled() {
        let chain = PostProcessChain::new(&config.postprocess, &backtester);
        let report = chain.run(&run, &periods)?;
        print_report(&report);
        Some(report)
    } else {
        None
    };

    if let Some(dir) = out {
        fs::create_dir_all(dir)?;
        let metadata = RunMetadata::new(ctx.run_id, config, &bars).with_data_file(&path);
        export_json(&RunRecord::new(metadata, &run, report.as_ref()), dir.join("run.json"))?;
        export_trials_csv(&run, dir.join("trials.csv"))?;
    }
    Ok(())
}

fn run_walkforward(config: &SieveFileConfig, data: Option<&Path>, out: Option<&Path>, progress: bool) -> Result<()> {
    let (path, bars) = load_bars(config, data)?;
    let analyzer = WalkForwardAnalyzer::new(
        config.search.clone(),
        config.walkforward.clone(),
        config.optimization.to_orchestrator_config(),
        backtester(config),
    )
    .with_postprocess(config.postprocess.clone());
    let ctx = RunContext::new().with_progress(progress);
    let result = analyzer.run(&bars, &ctx)?;

    print_windows(&result);
    println!("\n{}", result.summary_text());

    if let Some(dir) = out {
        fs::create_dir_all(dir)?;
        let metadata = RunMetadata::new(ctx.run_id, config, &bars).with_data_file(&path);
        let record = WalkForwardRecord::new(metadata, &result);
        export_json(&record, dir.join("walkforward.json"))?;
        export_stitched_csv(&record.stitched, dir.join("stitched.csv"))?;
    }
    Ok(())
}

fn fmt_value(v: f64) -> String {
    if v.is_finite() {
        format!("{:.4}", v)
    } else {
        v.to_string()
    }
}

fn print_trials(run: &OptimizationRun, top: usize) {
    let mut builder = Builder::new();
    let mut header = vec!["Rank".to_string(), "Trial".to_string(), "Params".to_string()];
    header.extend(run.space.objectives.iter().map(|o| o.metric.clone()));
    header.extend(["Feasible".to_string(), "Pareto".to_string()]);
    builder.push_record(header);

    for (i, trial) in run.ranked_trials().into_iter().take(top).enumerate() {
        let mut row = vec![(i + 1).to_string(), trial.number.to_string(), format_params(&trial.params)];
        row.extend((0..run.space.objectives.len()).map(|k| trial.value(k).map(fmt_value).unwrap_or_default()));
        row.push(if trial.is_feasible() { "yes" } else { "no" }.to_string());
        row.push(if run.is_pareto(trial.number) { "*" } else { "" }.to_string());
        builder.push_record(row);
    }

    let table = builder.build().with(Style::rounded()).to_string();
    println!("{}", table);
}

fn print_report(report: &PostProcessReport) {
    for stage in &report.stages {
        println!("\n{} (from {}):", stage.module, stage.source);
        let mut builder = Builder::new();
        builder.push_record(["Rank", "Was", "Change", "Trial", "Params"]);
        for r in &stage.results {
            builder.push_record([
                r.module_rank.to_string(),
                r.source_rank.to_string(),
                format!("{:+}", r.rank_change),
                r.trial_number.to_string(),
                format_params(&r.params),
            ]);
        }
        println!("{}", builder.build().with(Style::rounded()));
    }
    for skipped in &report.skipped {
        println!("Skipped {}: {}", skipped.module, skipped.reason);
    }
    if let Some(selected) = &report.selected {
        println!(
            "\nSelected by {}: trial #{} [{}]",
            report.final_source,
            selected.trial_number,
            format_params(&selected.params)
        );
    }
}

fn print_windows(result: &WalkForwardResult) {
    let mut builder = Builder::new();
    builder.push_record(["#", "IS", "OOS", "Ended by", "Params", "IS %", "OOS %"]);
    for w in &result.windows {
        builder.push_record([
            w.index.to_string(),
            format!("{} .. {}", w.is_start.format("%Y-%m-%d"), w.is_end.format("%Y-%m-%d")),
            format!("{} .. {}", w.oos_start.format("%Y-%m-%d"), w.oos_end.format("%Y-%m-%d")),
            match w.trigger {
                sieve::walkforward::WindowTrigger::Fixed => "fixed".to_string(),
                sieve::walkforward::WindowTrigger::Adaptive(t) => t.to_string(),
            },
            format_params(&w.selected_params),
            format!("{:.2}", w.is_return_pct()),
            format!("{:.2}", w.oos_return_pct()),
        ]);
    }
    println!("{}", builder.build().with(Style::rounded()));
}

fn print_coverage(config: &SieveFileConfig, trials: Option<usize>) {
    let mut coverage = config.optimization.coverage();
    if let Some(n) = trials {
        coverage.n_trials = n;
    }
    let plan = schedule(&config.search, &coverage);
    println!(
        "Coverage: {} points (minimum {}, recommended {})",
        plan.len(),
        plan.minimum,
        plan.recommended
    );
    if let Some(axis) = &plan.stratify_axis {
        println!("Stratified on '{}': {:?}", axis, plan.strata_sizes);
    }
    if let Some(advisory) = &plan.advisory {
        println!("Advisory: {}", advisory);
    }

    let mut builder = Builder::new();
    let mut header = vec!["#".to_string()];
    header.extend(config.search.params.iter().map(|p| p.name.clone()));
    builder.push_record(header);
    for (i, point) in plan.points.iter().enumerate() {
        let mut row = vec![i.to_string()];
        row.extend(
            config
                .search
                .params
                .iter()
                .map(|p| point.get(&p.name).map(|v| v.to_string()).unwrap_or_default()),
        );
        builder.push_record(row);
    }
    println!("{}", builder.build().with(Style::rounded()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse() {
        let cli = Cli::try_parse_from(["sieve", "-vv", "optimize", "-c", "sieve.toml", "-n", "50", "--out", "results"]);
        let cli = cli.unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Optimize { trials, out, top, .. } => {
                assert_eq!(trials, Some(50));
                assert_eq!(out, Some(PathBuf::from("results")));
                assert_eq!(top, 10);
            }
            _ => panic!("expected optimize"),
        }
    }

    #[test]
    fn test_walkforward_and_coverage_parse() {
        assert!(Cli::try_parse_from(["sieve", "walkforward", "--config", "sieve.toml"]).is_ok());
        assert!(Cli::try_parse_from(["sieve", "coverage", "-c", "sieve.toml", "-n", "24"]).is_ok());
        assert!(Cli::try_parse_from(["sieve", "optimize"]).is_err());
    }
}
