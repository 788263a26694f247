//! Shipwright operator CLI

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use shipwright_core::{logging, plan_flow, EngineConfig, SafetyValidator, Task};
use shipwright_harness::{run_simulator, SimulatorConfig};
use std::path::PathBuf;
use std::time::Duration;

fn cli() -> Command {
    Command::new("shipwright")
        .version(shipwright_core::VERSION)
        .about("Task orchestration and update-safety engine")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Engine configuration file (TOML)"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run a seeded simulation against faulty collaborators")
                .arg(
                    Arg::new("tasks")
                        .long("tasks")
                        .default_value("200")
                        .value_parser(value_parser!(usize))
                        .help("Number of tasks to submit"),
                )
                .arg(
                    Arg::new("capacity")
                        .long("capacity")
                        .value_parser(value_parser!(usize))
                        .help("Gate capacity (defaults to the configured value)"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("update-ratio")
                        .long("update-ratio")
                        .default_value("0.5")
                        .value_parser(value_parser!(f64))
                        .help("Fraction of tasks that update a live artifact"),
                )
                .arg(
                    Arg::new("transient-rate")
                        .long("transient-rate")
                        .default_value("0.2")
                        .value_parser(value_parser!(f64))
                        .help("Probability of a transient generator failure"),
                )
                .arg(
                    Arg::new("permanent-rate")
                        .long("permanent-rate")
                        .default_value("0.02")
                        .value_parser(value_parser!(f64))
                        .help("Probability of a permanent generator failure"),
                )
                .arg(
                    Arg::new("shrink-rate")
                        .long("shrink-rate")
                        .default_value("0.1")
                        .value_parser(value_parser!(f64))
                        .help("Probability the generator truncates its output"),
                ),
        )
        .subcommand(
            Command::new("validate")
                .about("Run the safety validator on two files")
                .arg(
                    Arg::new("previous")
                        .long("previous")
                        .value_parser(value_parser!(PathBuf))
                        .help("Currently published artifact (omit for a first round)"),
                )
                .arg(
                    Arg::new("candidate")
                        .long("candidate")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Newly generated artifact"),
                )
                .arg(
                    Arg::new("threshold")
                        .long("threshold")
                        .value_parser(value_parser!(f64))
                        .help("Destructive-shrink threshold override"),
                ),
        )
        .subcommand(
            Command::new("check-task")
                .about("Validate a task document and show the planned flow")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Task JSON file"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Print the effective configuration")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
}

fn load_config(matches: &ArgMatches) -> Result<EngineConfig> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => {
            let mut config = EngineConfig::new();
            config.apply_env_overrides()?;
            config.validate()?;
            Ok(config)
        }
    }
}

fn required<'a, T: Clone + Send + Sync + 'static>(args: &'a ArgMatches, name: &str) -> Result<&'a T> {
    args.get_one::<T>(name)
        .with_context(|| format!("missing --{name}"))
}

async fn simulate(config: &EngineConfig, args: &ArgMatches) -> Result<bool> {
    let sim = SimulatorConfig {
        seed: *required(args, "seed")?,
        tasks: *required(args, "tasks")?,
        capacity: args
            .get_one::<usize>("capacity")
            .copied()
            .unwrap_or(config.gate.capacity),
        update_ratio: *required(args, "update-ratio")?,
        transient_rate: *required(args, "transient-rate")?,
        permanent_rate: *required(args, "permanent-rate")?,
        shrink_rate: *required(args, "shrink-rate")?,
        max_latency: Duration::from_millis(3),
        shrink_threshold: config.safety.shrink_threshold,
    };
    if sim.capacity == 0 {
        bail!("--capacity must be >= 1");
    }

    println!("Running Shipwright Simulator...");
    println!("Tasks: {}", sim.tasks);
    println!("Capacity: {}", sim.capacity);
    println!("Seed: {}", sim.seed);
    println!();

    let report = run_simulator(sim).await;
    println!("{}", report.generate_text());
    Ok(report.passed())
}

fn shrink_threshold(value: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&value) {
        bail!("--threshold must be within [0.0, 1.0], got {value}");
    }
    Ok(value)
}

fn validate(config: &EngineConfig, args: &ArgMatches) -> Result<bool> {
    let candidate_path: &PathBuf = required(args, "candidate")?;
    let candidate = std::fs::read(candidate_path)
        .with_context(|| format!("reading {}", candidate_path.display()))?;
    let previous = match args.get_one::<PathBuf>("previous") {
        Some(path) => {
            Some(std::fs::read(path).with_context(|| format!("reading {}", path.display()))?)
        }
        None => None,
    };

    let mut safety = config.safety.clone();
    if let Some(threshold) = args.get_one::<f64>("threshold") {
        safety.shrink_threshold = shrink_threshold(*threshold)?;
    }
    let validator = SafetyValidator::from_config(&safety);
    let verdict = validator.validate(previous.as_deref(), &candidate);

    println!("Verdict: {}", verdict.kind);
    println!("Reason: {}", verdict.reason);
    if let Some(ratio) = verdict.shrink_ratio {
        println!("Shrink Ratio: {ratio:.3}");
    }
    println!("Publishes Previous: {}", verdict.is_fallback());
    Ok(verdict.content.is_some())
}

fn check_task(args: &ArgMatches) -> Result<bool> {
    let path: &PathBuf = required(args, "file")?;
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let task: Task = serde_json::from_str(&text).context("parsing task JSON")?;

    match task.validate() {
        Ok(()) => {
            println!("Task: {}", task.key());
            println!("Flow: {:?}", plan_flow(&task));
            println!("Attachments: {}", task.attachments.len());
            println!("Callback: {}", task.callback);
            Ok(true)
        }
        Err(error) => {
            println!("Rejected: {error}");
            Ok(false)
        }
    }
}

fn print_config(config: &EngineConfig, args: &ArgMatches) -> Result<()> {
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        print!("{}", config.to_toml_string()?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config = load_config(&matches)?;
    logging::init(&config.logging);
    tracing::debug!(
        capacity = config.gate.capacity,
        shrink_threshold = config.safety.shrink_threshold,
        "configuration loaded"
    );

    let passed = match matches.subcommand() {
        Some(("simulate", args)) => simulate(&config, args).await?,
        Some(("validate", args)) => validate(&config, args)?,
        Some(("check-task", args)) => check_task(args)?,
        Some(("config", args)) => {
            print_config(&config, args)?;
            true
        }
        _ => {
            cli().print_help()?;
            println!();
            true
        }
    };

    if !passed {
        std::process::exit(1);
    }
    Ok(())
}
