//! Subcommand implementations.

use anyhow::Context;
use tokio::sync::mpsc;

use hubwire_hub_connection::HubClient;
use hubwire_protocol::StateRecord;

use crate::Command;

pub(crate) async fn run(client: &HubClient, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Validate => validate(client).await,
        Command::States { domain } => states(client, domain.as_deref()).await,
        Command::State { entity_id } => {
            let state = client.get_state(&entity_id).await?;
            print_json(&state)
        }
        Command::Call {
            domain,
            service,
            data,
        } => call(client, &domain, &service, data.as_deref()).await,
        Command::Watch { event_type, count } => watch(client, &event_type, count).await,
    }
}

async fn validate(client: &HubClient) -> anyhow::Result<()> {
    let report = client.validate_connection().await;
    print_json(&report)?;
    if !report.success {
        anyhow::bail!("{}", report.message);
    }
    Ok(())
}

async fn states(client: &HubClient, domain: Option<&str>) -> anyhow::Result<()> {
    let all = client.get_all_states().await?;
    let selected = filter_domain(all, domain);
    for state in &selected {
        println!(
            "{:<40} {:<16} {}",
            state.entity_id,
            state.state,
            state.friendly_name().unwrap_or("")
        );
    }
    tracing::info!(count = selected.len(), "listed states");
    Ok(())
}

fn filter_domain(states: Vec<StateRecord>, domain: Option<&str>) -> Vec<StateRecord> {
    let mut selected: Vec<StateRecord> = states
        .into_iter()
        .filter(|s| domain.is_none_or(|d| s.domain() == d))
        .collect();
    selected.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    selected
}

async fn call(client: &HubClient, domain: &str, service: &str, data: Option<&str>) -> anyhow::Result<()> {
    let data = data
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--data must be valid JSON")?;
    let resp = client.call_service(domain, service, data).await?;
    print_json(&resp)
}

async fn watch(client: &HubClient, event_type: &str, count: Option<usize>) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = client
        .subscribe_to_events(event_type, move |event| {
            let _ = tx.send(event.clone());
        })
        .await?;
    tracing::info!(event_type, "watching, press Ctrl-C to stop");

    let mut seen = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                print_json(&event)?;
                seen += 1;
                if count.is_some_and(|n| seen >= n) {
                    break;
                }
            }
        }
    }

    subscription.unsubscribe().await;
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
