//! Print the recorded history of research-report instances.
//!
//! Usage:
//!   research-report-history              # list instances and their step
//!   research-report-history <instance>   # dump one instance's event log

use color_eyre::eyre::eyre;

use research_report::history::EventKind;
use research_report::{AppConfig, Event, EventLogStore, FileEventLog, InstanceState};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::load()?;
    let store = FileEventLog::open(&config.store.dir).await?;

    match std::env::args().nth(1) {
        None => {
            for id in store.list_instances().await? {
                let events = store.read_all(&id).await?;
                match InstanceState::replay(&id, &events) {
                    Ok(state) => println!("{id}\t{:?}\t{} events", state.step, events.len()),
                    Err(e) => println!("{id}\tunreadable: {e}"),
                }
            }
        }
        Some(id) => {
            let events = store.read_all(&id).await?;
            if events.is_empty() {
                return Err(eyre!("no history for instance {id}"));
            }
            for event in &events {
                println!("{}", describe(event));
            }
            let state = InstanceState::replay(&id, &events)?;
            println!("-- step: {:?}", state.step);
            if let Some(result) = &state.result {
                println!("-- result: {}", serde_json::to_string(result)?);
            }
        }
    }
    Ok(())
}

fn describe(event: &Event) -> String {
    let detail = match &event.kind {
        EventKind::InstanceStarted { prompt, model, .. } => {
            format!("model={model} prompt={prompt:?}")
        }
        EventKind::ActivityScheduled { invocation } => format!(
            "{} timeout={:?} max_attempts={}",
            invocation.name,
            invocation.options.start_to_close_timeout,
            invocation.options.retry_policy.maximum_attempts
        ),
        EventKind::ActivityCompleted { scheduled_seq, output } => {
            let text = output.as_str().unwrap_or_default();
            format!("for #{scheduled_seq}: {} chars", text.chars().count())
        }
        EventKind::ActivityFailed {
            scheduled_seq,
            error,
        } => format!("for #{scheduled_seq}: {error}"),
        EventKind::SignalReceived { signal } => match &signal.additional_prompt {
            Some(extra) => format!("{} ({extra:?})", signal.decision),
            None => signal.decision.clone(),
        },
        EventKind::InstanceCompleted { outcome } => format!("{outcome:?}"),
    };
    format!(
        "#{:<4} {} {:<20} {}",
        event.seq,
        event.recorded_at.to_rfc3339(),
        event.kind.name(),
        detail
    )
}
