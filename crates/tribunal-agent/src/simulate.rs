//! In-process roster simulation.
//!
//! Every roster member runs as its own [`OrchestratorService`] on a shared
//! [`LocalChannelHub`]. Lines on stdin are posted as the override identity;
//! a few slash commands cast override votes and inspect state.

use std::sync::Arc;

use anyhow::{Context, Result};
use coordination::channel::symbols;
use coordination::tools::ToolBackend;
use coordination::{
    ChannelEvent, ChatChannel, CliBackend, FileKvStore, HttpCompletionClient, LocalChannelHub,
    OrchestratorService, RecordingBackend, ScriptedCompletionClient, ServiceDeps,
    SharedCompletionClient, SharedKvStore, TribunalConfig,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

const OFFLINE_REPLY: &str = "Acknowledged. (offline mode: no completion endpoint)";

pub struct SimulateOptions {
    pub offline: bool,
    pub dry_run: bool,
    pub channel: String,
}

/// A line typed by the operator.
#[derive(Debug, PartialEq, Eq)]
enum FounderCommand {
    Say(String),
    Vote { message_id: String, approve: bool },
    Pending,
    Status,
    Quit,
    Unknown(String),
    Blank,
}

fn parse_command(line: &str) -> FounderCommand {
    let line = line.trim();
    if line.is_empty() {
        return FounderCommand::Blank;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return FounderCommand::Say(line.to_string());
    };
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("approve"), Some(id), None) => FounderCommand::Vote {
            message_id: id.to_string(),
            approve: true,
        },
        (Some("deny"), Some(id), None) => FounderCommand::Vote {
            message_id: id.to_string(),
            approve: false,
        },
        (Some("pending"), None, None) => FounderCommand::Pending,
        (Some("status"), None, None) => FounderCommand::Status,
        (Some("quit"), None, None) => FounderCommand::Quit,
        _ => FounderCommand::Unknown(line.to_string()),
    }
}

pub async fn run(config: TribunalConfig, options: SimulateOptions) -> Result<()> {
    let hub = LocalChannelHub::new();

    let completion: SharedCompletionClient = if options.offline {
        Arc::new(ScriptedCompletionClient::new().with_fallback(OFFLINE_REPLY))
    } else {
        Arc::new(
            HttpCompletionClient::new(config.completion.clone())
                .context("building completion client")?,
        )
    };
    let backend: Arc<dyn ToolBackend> = if options.dry_run {
        Arc::new(RecordingBackend::new())
    } else {
        Arc::new(CliBackend::new(&config.tools))
    };

    let printer = tokio::spawn(print_traffic(hub.subscribe()));

    let mut services = Vec::new();
    let mut handles = Vec::new();
    for identity in &config.agent.roster {
        let mut agent_config = config.clone();
        agent_config.agent = config.agent.for_identity(identity);
        agent_config
            .validate()
            .with_context(|| format!("config for roster member {identity}"))?;

        let kv: SharedKvStore = Arc::new(FileKvStore::new(config.storage.dir.join(identity)));
        let deps = ServiceDeps::new(
            Arc::new(hub.channel_for(identity)),
            completion.clone(),
            kv,
            backend.clone(),
        );
        let service = OrchestratorService::new(agent_config, deps);
        handles.push(service.start());
        services.push(service);
    }
    info!(
        roster = ?config.agent.roster,
        founder = %config.agent.override_identity,
        channel = %options.channel,
        "Simulation running; type messages, /approve <id>, /deny <id>, /pending, /status or /quit"
    );

    let founder = hub.channel_for(&config.agent.override_identity);
    let target = founder
        .fetch(&options.channel)
        .await
        .context("resolving input channel")?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line.context("reading stdin")?,
        };
        let Some(line) = line else { break };

        match parse_command(&line) {
            FounderCommand::Blank => {}
            FounderCommand::Quit => break,
            FounderCommand::Say(text) => {
                if let Err(e) = founder.post(&target, &text).await {
                    warn!(error = %e, "Failed to post");
                }
            }
            FounderCommand::Vote {
                message_id,
                approve,
            } => match hub.find(&message_id) {
                Some(handle) => {
                    let symbol = if approve {
                        symbols::APPROVE
                    } else {
                        symbols::DENY
                    };
                    if let Err(e) = founder.annotate(&handle, symbol).await {
                        warn!(error = %e, "Failed to vote");
                    }
                }
                None => println!("no message with id {message_id}"),
            },
            FounderCommand::Pending => {
                for service in &services {
                    for pending in service.coordinator().pending() {
                        println!(
                            "#{} {} by {} ({} approve, {} deny, {})",
                            pending.id,
                            pending.tool,
                            pending.proposer,
                            pending.approvals,
                            pending.denials,
                            pending.source
                        );
                    }
                }
            }
            FounderCommand::Status => {
                for service in &services {
                    let status = serde_json::to_string_pretty(&service.status())
                        .context("rendering status")?;
                    println!("{status}");
                }
            }
            FounderCommand::Unknown(line) => println!("unrecognized command: {line}"),
        }
    }

    for handle in handles {
        handle.stop().await;
    }
    printer.abort();
    info!("Simulation stopped");
    Ok(())
}

async fn print_traffic(mut rx: broadcast::Receiver<ChannelEvent>) {
    loop {
        match rx.recv().await {
            Ok(ChannelEvent::Message(m)) => println!(
                "[#{} {}] {}: {}",
                m.handle.channel_id, m.handle.message_id, m.author, m.content
            ),
            Ok(ChannelEvent::Annotation(a)) => println!(
                "  {} {} {} on #{}",
                a.author,
                if a.added { "added" } else { "removed" },
                a.symbol,
                a.handle.message_id
            ),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Traffic printer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_lines_are_posted() {
        assert_eq!(
            parse_command("  @arbiter what is the balance? "),
            FounderCommand::Say("@arbiter what is the balance?".into())
        );
        assert_eq!(parse_command("   "), FounderCommand::Blank);
    }

    #[test]
    fn test_slash_commands() {
        assert_eq!(
            parse_command("/approve 17"),
            FounderCommand::Vote {
                message_id: "17".into(),
                approve: true
            }
        );
        assert_eq!(
            parse_command("/deny 3"),
            FounderCommand::Vote {
                message_id: "3".into(),
                approve: false
            }
        );
        assert_eq!(parse_command("/pending"), FounderCommand::Pending);
        assert_eq!(parse_command("/quit"), FounderCommand::Quit);
        assert!(matches!(
            parse_command("/approve"),
            FounderCommand::Unknown(_)
        ));
        assert!(matches!(
            parse_command("/approve 1 2"),
            FounderCommand::Unknown(_)
        ));
    }
}
