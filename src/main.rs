mod cli;

use agent_mesh::coordinator::HelpOptions;
use agent_mesh::protocol::{MessageKind, Payload, EXCHANGE_HELPER_SELECTED};
use agent_mesh::{logger, AgentCapabilities, AgentNetworkClient, Envelope, NetworkConfig, RequestStatus};
use anyhow::Result;
use cli::Command;
use std::io::Write;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Estimate attached to offers typed at the prompt
const DEFAULT_ESTIMATE_MINUTES: u32 = 15;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args()?;

    logger::init(args.verbose);

    info!("agent-mesh v{}", env!("CARGO_PKG_VERSION"));

    let (capabilities, config) = cli::resolve(&args)?;
    let exit_code = run(capabilities, config).await?;

    std::process::exit(exit_code);
}

async fn run(capabilities: AgentCapabilities, config: NetworkConfig) -> Result<i32> {
    let client = AgentNetworkClient::new(capabilities, config)?;

    info!("Starting agent {}", client.agent_id());
    info!("  Url: {}", client.config().transport.url);
    info!("  Channel: {}", client.config().transport.channel);
    info!("  Capabilities: {:?}", client.capabilities().capabilities);

    register_printers(&client);

    if !client.connect().await {
        return Ok(1);
    }

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(100);
    let is_tty = std::io::IsTerminal::is_terminal(&std::io::stdin());
    let stdin_handle = tokio::spawn(read_commands(cmd_tx, is_tty));

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                match command {
                    Some(Command::Quit) | None => break,
                    Some(command) => execute(&client, command).await,
                }
                prompt();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    stdin_handle.abort();
    client.disconnect().await;
    Ok(0)
}

/// Forward parsed stdin lines; without a TTY just idle until Ctrl+C
async fn read_commands(cmd_tx: mpsc::Sender<Command>, is_tty: bool) {
    if !is_tty {
        info!("Running in non-interactive mode (no TTY)");
        std::future::pending::<()>().await;
    }

    use tokio::io::{AsyncBufReadExt, BufReader};
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("\n{}\n", cli::COMMAND_HELP);
    prompt();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match cli::parse_command(&line) {
                Ok(Some(command)) => {
                    let quit = command == Command::Quit;
                    if cmd_tx.send(command).await.is_err() || quit {
                        break;
                    }
                }
                Ok(None) => prompt(),
                Err(usage) => {
                    println!("{}", usage);
                    prompt();
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Stdin error: {}", e);
                break;
            }
        }
    }
}

fn prompt() {
    print!("> ");
    std::io::stdout().flush().ok();
}

/// Print the traffic a human at the prompt cares about
fn register_printers(client: &AgentNetworkClient) {
    client.register_message_handler(MessageKind::Message, None, |envelope: Envelope| async move {
        if let Payload::Message(message) = &envelope.payload {
            println!("\n[{}] {}", envelope.source, message.content);
            prompt();
        }
        Ok::<(), anyhow::Error>(())
    });

    client.register_message_handler(MessageKind::HelpWanted, None, |envelope: Envelope| async move {
        if let Payload::HelpWanted(wanted) = &envelope.payload {
            println!(
                "\n[Help wanted] {} from {} needs {:?}: {}",
                wanted.request_id, envelope.source, wanted.required_capabilities, wanted.description
            );
            prompt();
        }
        Ok::<(), anyhow::Error>(())
    });

    client.register_message_handler(MessageKind::HelpResponse, None, |envelope: Envelope| async move {
        if let Payload::HelpResponse(offer) = &envelope.payload {
            println!(
                "\n[Offer] {} on {} (confidence {:.2}, ~{}m): {}",
                envelope.source,
                offer.request_id,
                offer.confidence_level,
                offer.estimated_time_minutes,
                offer.message
            );
            prompt();
        }
        Ok::<(), anyhow::Error>(())
    });

    client.register_message_handler(MessageKind::TechnicalExchange, None, |envelope: Envelope| async move {
        if let Payload::TechnicalExchange(exchange) = &envelope.payload {
            let request = exchange.request_id.as_deref().unwrap_or("-");
            if exchange.exchange_type == EXCHANGE_HELPER_SELECTED {
                println!("\n[*] {} picked you for {}", envelope.source, request);
            } else {
                println!("\n[{}] {} on {}", exchange.exchange_type, envelope.source, request);
            }
            prompt();
        }
        Ok::<(), anyhow::Error>(())
    });
}

async fn execute(client: &AgentNetworkClient, command: Command) {
    match command {
        Command::Ask { capabilities, description } => {
            match client.request_help(&capabilities, &description, HelpOptions::default()).await {
                Ok(Some(id)) => println!("Asked for help: {}", id),
                Ok(None) => println!("Request could not be published"),
                Err(e) => println!("Invalid request: {}", e),
            }
        }
        Command::Offer { request_id, confidence, message } => {
            let offered = client.capabilities().capabilities.clone();
            match client
                .respond_to_help(&request_id, &message, &offered, DEFAULT_ESTIMATE_MINUTES, confidence)
                .await
            {
                Ok(Some(id)) => println!("Offer sent: {}", id),
                Ok(None) => println!("Cannot offer on {}", request_id),
                Err(e) => println!("Cannot offer: {}", e),
            }
        }
        Command::Responses { request_id } => {
            let ranked = client.best_responses(&request_id, 10).await;
            if ranked.is_empty() {
                println!("No offers on {}", request_id);
            }
            for (rank, entry) in ranked.iter().enumerate() {
                println!(
                    "  {}. {} score {:.2} confidence {:.2}: {}",
                    rank + 1,
                    entry.response.responder_id,
                    entry.score,
                    entry.response.confidence,
                    entry.response.message
                );
            }
        }
        Command::Select { request_id, agent_id } => {
            if client.select_helper(&request_id, &agent_id).await {
                println!("{} is now helping with {}", agent_id, request_id);
            } else {
                println!("Could not select {} for {}", agent_id, request_id);
            }
        }
        Command::Done { request_id, success } => {
            if client.complete_help_request(&request_id, success, None).await {
                println!("Closed {}", request_id);
            } else {
                println!("Could not close {}", request_id);
            }
        }
        Command::Agents { capabilities } => {
            let found = client.find_best_agents(&capabilities, 20).await;
            if found.is_empty() {
                println!("No matching agents");
            }
            for entry in found {
                let agent = &entry.agent;
                println!(
                    "  {} [{}] match {:.2} trust {:.2}: {}",
                    agent.agent_id(),
                    agent.status,
                    entry.match_score,
                    agent.trust_score,
                    agent.capabilities.capabilities.join(",")
                );
            }
        }
        Command::Requests => {
            let open: Vec<_> = client
                .get_help_requests(None)
                .await
                .into_iter()
                .filter(|r| matches!(r.status, RequestStatus::Pending | RequestStatus::Responded))
                .collect();
            if open.is_empty() {
                println!("No open requests");
            }
            for request in open {
                println!(
                    "  {} from {} [{}] {:?}: {}",
                    request.request_id,
                    request.requester_id,
                    request.status,
                    request.required_capabilities,
                    request.description
                );
            }
        }
        Command::Say { text } => match client.send_simple_message(&text, None).await {
            Ok(true) => {}
            Ok(false) => println!("Message not delivered"),
            Err(e) => println!("Invalid message: {}", e),
        },
        Command::Status => {
            let stats = client.get_network_stats().await;
            match serde_json::to_string_pretty(&stats) {
                Ok(json) => println!("{}", json),
                Err(e) => println!("Could not render stats: {}", e),
            }
        }
        Command::Help => println!("{}", cli::COMMAND_HELP),
        Command::Quit => {}
    }
}
