//! CLI argument parsing and interactive command parsing

use agent_mesh::config_loader::load_cascading_config;
use agent_mesh::{AgentCapabilities, NetworkConfig};
use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub agent_id: Option<String>,
    pub capabilities: Vec<String>,
    pub specializations: Vec<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub channel: Option<String>,
    pub config: Option<PathBuf>,
    pub presence_interval_ms: Option<u64>,
    pub discovery_interval_ms: Option<u64>,
    pub verbose: bool,
}

#[derive(Parser, Debug)]
#[command(name = "agent-mesh")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Join an agent network: announce capabilities, find peers, ask for and offer help")]
struct Args {
    /// Agent id (default: from config file, else generated)
    #[arg(long)]
    agent_id: Option<String>,

    /// Capability tag, repeatable or comma-separated (e.g. --capability python,pandas)
    #[arg(long = "capability", short = 'C', value_delimiter = ',')]
    capabilities: Vec<String>,

    /// Specialization tag, repeatable or comma-separated
    #[arg(long = "specialization", short = 'S', value_delimiter = ',')]
    specializations: Vec<String>,

    /// Free-text description announced with the capabilities
    #[arg(long)]
    description: Option<String>,

    /// Transport URL
    ///
    /// Value formats:
    ///   memory://<name>                       In-process broker
    ///   mesh://<topic>?peer=<multiaddr>       P2P gossipsub (feature "gossipsub")
    ///   /ip4/1.2.3.4/tcp/4001/p2p/<peer-id>   Raw multiaddr
    #[arg(long)]
    url: Option<String>,

    /// Channel every agent publishes on
    #[arg(long)]
    channel: Option<String>,

    /// Extra config file, applied after the cascading ones
    #[arg(long)]
    config: Option<PathBuf>,

    /// Presence announcement interval (e.g. "30s", "1m")
    #[arg(long)]
    presence_interval: Option<String>,

    /// Discovery scan interval (e.g. "2m")
    #[arg(long)]
    discovery_interval: Option<String>,

    /// Debug logging
    #[arg(long, default_value = "false")]
    verbose: bool,
}

/// Parse CLI arguments
pub fn parse_args() -> Result<CliArgs> {
    from_args(Args::parse())
}

fn from_args(args: Args) -> Result<CliArgs> {
    let presence_interval_ms = args
        .presence_interval
        .as_deref()
        .map(parse_duration)
        .transpose()?;
    let discovery_interval_ms = args
        .discovery_interval
        .as_deref()
        .map(parse_duration)
        .transpose()?;

    Ok(CliArgs {
        agent_id: args.agent_id,
        capabilities: args.capabilities,
        specializations: args.specializations,
        description: args.description,
        url: args.url,
        channel: args.channel,
        config: args.config,
        presence_interval_ms,
        discovery_interval_ms,
        verbose: args.verbose,
    })
}

/// Merge config files with the command line; flags win
pub fn resolve(args: &CliArgs) -> Result<(AgentCapabilities, NetworkConfig)> {
    let file = load_cascading_config(args.config.as_deref())?;
    let mut network = file.network_config()?;

    if let Some(url) = &args.url {
        network.transport.url = url.clone();
    }
    if let Some(channel) = &args.channel {
        network.transport.channel = channel.clone();
    }
    if let Some(ms) = args.presence_interval_ms {
        network.client.presence_interval_secs = millis_to_secs(ms);
    }
    if let Some(ms) = args.discovery_interval_ms {
        network.client.discovery_interval_secs = millis_to_secs(ms);
    }
    network.validate()?;

    let agent_id = args
        .agent_id
        .clone()
        .or(file.agent_id)
        .unwrap_or_else(generate_agent_id);
    let capabilities = if args.capabilities.is_empty() {
        file.capabilities.unwrap_or_default()
    } else {
        args.capabilities.clone()
    };
    let specializations = if args.specializations.is_empty() {
        file.specializations.unwrap_or_default()
    } else {
        args.specializations.clone()
    };

    let mut agent = AgentCapabilities::new(agent_id, capabilities, specializations)?;
    if let Some(description) = args.description.clone().or(file.description) {
        agent = agent.with_description(description);
    }
    Ok((agent, network))
}

fn generate_agent_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("agent-{}", &id[..8])
}

/// Sub-second intervals round up to one second
fn millis_to_secs(ms: u64) -> u64 {
    ms.div_ceil(1000).max(1)
}

/// Parse human-readable duration to milliseconds
fn parse_duration(s: &str) -> Result<u64> {
    let s = s.trim();

    if let Ok(duration) = humantime::parse_duration(s) {
        return Ok(duration.as_millis() as u64);
    }

    // Plain number means seconds
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(secs * 1000);
    }

    Err(anyhow!("Invalid duration format: {}", s))
}

/// One line typed at the interactive prompt
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ask { capabilities: Vec<String>, description: String },
    Offer { request_id: String, confidence: f64, message: String },
    Responses { request_id: String },
    Select { request_id: String, agent_id: String },
    Done { request_id: String, success: bool },
    Agents { capabilities: Vec<String> },
    Requests,
    Say { text: String },
    Status,
    Help,
    Quit,
}

pub const COMMAND_HELP: &str = "\
[Commands]
  /ask <caps,...> <description>        - Ask the network for help
  /requests                            - List open requests from others
  /offer <request-id> <conf> <message> - Offer help (confidence 0..1)
  /responses <request-id>              - Rank offers on your request
  /select <request-id> <agent>         - Pick a helper
  /done <request-id> ok|fail           - Close a request, updating trust
  /agents [caps,...]                   - Known agents, best match first
  /say <text>                          - Broadcast a message
  /status                              - Network stats
  /quit                                - Leave the network";

/// Parse a prompt line. `Ok(None)` for blank input, `Err` carries the usage hint.
pub fn parse_command(line: &str) -> std::result::Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(Command::Say { text: line.to_string() }));
    }

    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };

    let command = match name {
        "/ask" => {
            let (caps, description) = rest
                .split_once(char::is_whitespace)
                .ok_or("Usage: /ask <caps,...> <description>")?;
            Command::Ask {
                capabilities: split_tags(caps),
                description: description.trim().to_string(),
            }
        }
        "/offer" => {
            let mut parts = rest.splitn(3, char::is_whitespace);
            let usage = "Usage: /offer <request-id> <confidence> <message>";
            let request_id = parts.next().filter(|s| !s.is_empty()).ok_or(usage)?;
            let confidence = parts
                .next()
                .and_then(|c| c.parse::<f64>().ok())
                .ok_or(usage)?;
            let message = parts.next().map(str::trim).filter(|s| !s.is_empty()).ok_or(usage)?;
            Command::Offer {
                request_id: request_id.to_string(),
                confidence,
                message: message.to_string(),
            }
        }
        "/responses" if !rest.is_empty() => Command::Responses {
            request_id: rest.to_string(),
        },
        "/responses" => return Err("Usage: /responses <request-id>".into()),
        "/select" => {
            let (request_id, agent_id) = rest
                .split_once(char::is_whitespace)
                .ok_or("Usage: /select <request-id> <agent>")?;
            Command::Select {
                request_id: request_id.to_string(),
                agent_id: agent_id.trim().to_string(),
            }
        }
        "/done" => {
            let (request_id, outcome) = rest
                .split_once(char::is_whitespace)
                .ok_or("Usage: /done <request-id> ok|fail")?;
            let success = match outcome.trim() {
                "ok" | "success" | "yes" => true,
                "fail" | "failed" | "no" => false,
                _ => return Err("Usage: /done <request-id> ok|fail".into()),
            };
            Command::Done {
                request_id: request_id.to_string(),
                success,
            }
        }
        "/agents" => Command::Agents {
            capabilities: split_tags(rest),
        },
        "/requests" => Command::Requests,
        "/say" if !rest.is_empty() => Command::Say { text: rest.to_string() },
        "/say" => return Err("Usage: /say <text>".into()),
        "/status" | "/s" => Command::Status,
        "/help" | "/?" => Command::Help,
        "/quit" | "/exit" | "/q" => Command::Quit,
        other => return Err(format!("Unknown command: {}. Try /help", other)),
    };
    Ok(Some(command))
}

fn split_tags(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
