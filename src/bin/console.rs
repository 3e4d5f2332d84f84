//! Operator console for the research-report workflow.
//!
//! Runs the orchestrator in-process against the file-backed event log,
//! starts (or resumes) an instance and lets the operator keep, edit, query
//! or cancel it.
//!
//! Usage:
//!   research-report ["research prompt"] [--id <instance-id>]
//!   research-report --resume <instance-id>
//!
//! Configuration: see `research_report::config` (`RESEARCH_REPORT_CONFIG`,
//! `OPENAI_API_KEY`, `RESEARCH_STUB_MODEL`, `RESEARCH_DATA_DIR`, ...).

use std::io::Write;
use std::sync::Arc;

use color_eyre::eyre::{bail, eyre};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use research_report::gateway::QUERY_RESEARCH_RESULT;
use research_report::{
    ActivityExecutor, ActivityRegistry, AppConfig, FileEventLog, Gateway, Orchestrator, Outcome,
    UserDecision,
};

const DEFAULT_PROMPT: &str =
    "Give me 5 fun and fascinating facts about tardigrades. Make them interesting and educational!";

/// How many characters of research the `query` command shows.
const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Default)]
struct Args {
    prompt: Option<String>,
    id: Option<String>,
    resume: Option<String>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> color_eyre::Result<Args> {
    let mut parsed = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--id" => parsed.id = Some(args.next().ok_or_else(|| eyre!("--id needs a value"))?),
            "--resume" => {
                parsed.resume = Some(args.next().ok_or_else(|| eyre!("--resume needs a value"))?);
            }
            flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
            _ if parsed.prompt.is_none() => parsed.prompt = Some(arg),
            _ => bail!("unexpected argument {arg:?}"),
        }
    }
    if parsed.resume.is_some() && (parsed.prompt.is_some() || parsed.id.is_some()) {
        bail!("--resume cannot be combined with a prompt or --id");
    }
    Ok(parsed)
}

type StdinLines = Lines<BufReader<Stdin>>;

fn prompt_line(text: &str) {
    print!("{text}");
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    let config = AppConfig::load()?;

    let store = Arc::new(FileEventLog::open(&config.store.dir).await?);
    let mut registry = ActivityRegistry::new();
    config.activities().register(&mut registry);
    let executor = Arc::new(ActivityExecutor::new(registry));
    let orchestrator = Orchestrator::new(store, executor, config.workflow_settings());
    let gateway = Gateway::new(orchestrator.clone());

    tracing::info!(
        store = %config.store.dir.display(),
        model = %config.model.name,
        "console starting"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let instance_id = match args.resume {
        Some(id) => {
            let recovered = orchestrator.recover().await?;
            for (skipped, error) in &recovered.skipped {
                println!("Skipped unreadable instance {skipped}: {error}");
            }
            let snapshot = orchestrator.query_state(&id).await?;
            println!(
                "Resumed instance {id} at step {:?} ({} unfinished instance(s) recovered)",
                snapshot.step, recovered.resumed
            );
            id
        }
        None => {
            println!("Welcome to the Research Report Generator!");
            let prompt = match args.prompt {
                Some(prompt) => prompt,
                None => {
                    prompt_line("Enter your research topic or question: ");
                    lines.next_line().await?.unwrap_or_default().trim().to_string()
                }
            };
            let prompt = if prompt.is_empty() {
                println!("No prompt entered. Using default: {DEFAULT_PROMPT}");
                DEFAULT_PROMPT.to_string()
            } else {
                prompt
            };

            let id = match args.id {
                Some(id) => {
                    orchestrator.start_instance_with_id(&id, prompt).await?;
                    id
                }
                None => orchestrator.start_instance(prompt).await?,
            };
            println!("Started instance. Instance ID: {id}");
            id
        }
    };

    let outcome = tokio::select! {
        outcome = orchestrator.await_result(&instance_id) => Some(outcome?),
        console = run_console(&gateway, &orchestrator, &instance_id, &mut lines) => {
            console?;
            None
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted. Resume later with: research-report --resume {instance_id}");
            orchestrator.shutdown().await;
            return Ok(());
        }
    };

    let outcome = match outcome {
        Some(outcome) => outcome,
        None => orchestrator.await_result(&instance_id).await?,
    };
    match outcome {
        Outcome::Succeeded { artifact_id } => {
            println!("Result: Successfully created research report: {artifact_id}");
        }
        Outcome::Failed { reason } => println!("Instance failed: {reason}"),
    }

    orchestrator.shutdown().await;
    Ok(())
}

/// Show each new round of research as it arrives and prompt for decisions
/// until the operator keeps it, cancels, or closes stdin.
async fn run_console(
    gateway: &Gateway,
    orchestrator: &Orchestrator,
    instance_id: &str,
    lines: &mut StdinLines,
) -> color_eyre::Result<()> {
    let mut seen_rounds = 0;
    loop {
        let snapshot = orchestrator.next_decision_point(instance_id, seen_rounds).await?;
        if snapshot.is_terminal() {
            return Ok(());
        }
        seen_rounds = snapshot.research_rounds;
        println!("\nResearch content:");
        println!("{}", snapshot.research.as_deref().unwrap_or_default());

        loop {
            println!("\n{}", "=".repeat(50));
            println!("Research is complete. What would you like to do?");
            println!("1. Type 'keep' to approve the research and create the report");
            println!("2. Type 'edit' to modify the research");
            println!("3. Type 'query' to show the latest research result");
            println!("4. Type 'cancel' to abandon this report");
            println!("{}", "=".repeat(50));
            prompt_line("Your decision (keep/edit/query/cancel): ");

            let Some(line) = lines.next_line().await? else {
                return Ok(());
            };
            match line.trim().to_lowercase().as_str() {
                "keep" => {
                    gateway.signal(instance_id, UserDecision::keep()).await?;
                    println!("Signal sent to keep research and create the report");
                    return Ok(());
                }
                "edit" => {
                    prompt_line("Enter additional instructions for the research (optional): ");
                    let extra = lines
                        .next_line()
                        .await?
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty());
                    gateway.signal(instance_id, UserDecision::edit(extra)).await?;
                    println!("Signal sent to regenerate research");
                    break;
                }
                "query" => {
                    let result = gateway.query(instance_id, QUERY_RESEARCH_RESULT).await?;
                    match result.as_str() {
                        Some(text) => {
                            let preview: String = text.chars().take(PREVIEW_CHARS).collect();
                            println!("Research Result: {preview}...");
                        }
                        None => println!("Research Result: Not yet available"),
                    }
                }
                "cancel" => {
                    orchestrator.cancel(instance_id).await?;
                    println!("Instance cancelled");
                    return Ok(());
                }
                _ => println!("Please enter 'keep', 'edit', 'query' or 'cancel'"),
            }
        }
    }
}
