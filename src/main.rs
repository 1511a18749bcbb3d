use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, Parser};
use tracing::{error, info, warn};

use inbox_triage::channels::{GmailClient, GmailConfig};
use inbox_triage::config::TriageConfig;
use inbox_triage::llm::{LlmClassifier, LlmConfig};
use inbox_triage::logging;
use inbox_triage::pipeline::loader::load_rule_set;
use inbox_triage::pipeline::processor::{BatchReport, TriageOptions, TriageProcessor};
use inbox_triage::pipeline::types::LabelCatalog;

/// Classify inbox messages and apply labels.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Maximum number of candidate messages to process
    #[arg(short = 'n', long, default_value_t = 10, allow_negative_numbers = true)]
    num_messages: i64,

    /// Decide labels without applying them; print what would be applied
    #[arg(long)]
    dry_run: bool,

    /// -v prints per-message results, -vv also raw model output and rule decisions
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Rules file (overrides RULES_CONFIG_FILE)
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Label catalog file (overrides LABEL_CONFIG_FILE)
    #[arg(long)]
    labels: Option<PathBuf>,

    /// Print the batch report as JSON on stdout when done
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let mut config = TriageConfig::from_env();
    if let Some(path) = &cli.rules {
        config.rules_config_file = path.clone();
    }
    if let Some(path) = &cli.labels {
        config.label_config_file = path.clone();
    }

    let _guard = match logging::init(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return ExitCode::from(1);
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), "Inbox triage starting");

    tokio::select! {
        result = run(&cli, &config) => match result {
            Ok(report) => {
                if cli.json {
                    match serde_json::to_string_pretty(&report) {
                        Ok(json) => println!("{json}"),
                        Err(e) => {
                            error!(error = %e, "Failed to serialize batch report");
                            return ExitCode::from(1);
                        }
                    }
                } else if cli.dry_run || cli.verbose > 0 {
                    println!(
                        "Processed {}: {} succeeded, {} failed",
                        report.processed, report.succeeded, report.failed
                    );
                }
                info!("Inbox triage completed successfully");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "Inbox triage failed");
                ExitCode::from(1)
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("Inbox triage interrupted by user");
            ExitCode::from(130)
        }
    }
}

async fn run(cli: &Cli, config: &TriageConfig) -> inbox_triage::Result<BatchReport> {
    let catalog = LabelCatalog::load(&config.label_config_file)?;
    let rules = load_rule_set(&config.rules_config_file)?;

    let classifier = LlmClassifier::new(LlmConfig::from_env()?)?;
    classifier.verify().await?;

    let gmail = GmailClient::connect(GmailConfig::from_env()?).await?;

    let processor = TriageProcessor::new(
        Arc::new(gmail),
        Arc::new(classifier),
        rules,
        catalog,
        TriageOptions {
            dry_run: cli.dry_run,
            verbosity: cli.verbose,
        },
    );

    Ok(processor.run(cli.num_messages).await?)
}
