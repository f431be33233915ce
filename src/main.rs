use anyhow::Context;
use clap::{Parser, Subcommand};
use llmdock::coordinator::EngineEvent;
use llmdock::llm::ChatMessage;
use llmdock::logging::LogFilter;
use llmdock::AppState;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "llmdock", version, about = "Deploy, tunnel to and chat with remote LLM servers")]
struct Args {
    /// Print engine events as JSON lines
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured servers
    List,
    /// Show one server
    Status { server: String },
    /// Check SSH reachability and, if deployed, LLM health
    Test { server: String },
    /// Install and start the LLM server
    Deploy { server: String },
    /// Open a tunnel and keep it up until interrupted
    Connect { server: String },
    /// Test, deploy if needed and connect, then keep the tunnel up
    EnsureReady { server: String },
    /// Send one prompt through a fresh tunnel
    Chat {
        server: String,
        prompt: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        system: Option<String>,
    },
    /// Show recent operation logs
    Logs {
        #[arg(long)]
        server: Option<String>,
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llmdock=info,warn".into()),
        )
        .init();

    let args = Args::parse();
    let state = AppState::load().await.context("failed to load llmdock state")?;
    let coordinator = state.coordinator.clone();

    let printer = tokio::spawn(print_events(coordinator.subscribe(), args.json));
    let result = run(&state, args.command).await;

    coordinator.shutdown().await;
    printer.abort();
    result
}

async fn run(state: &AppState, command: Command) -> anyhow::Result<()> {
    let coordinator = &state.coordinator;
    match command {
        Command::List => {
            for server in coordinator.get_all_servers() {
                println!(
                    "{:<16} {:<24} {:<13} deployed={} llm_port={}",
                    server.id,
                    format!("{}:{}", server.host, server.port),
                    server.status,
                    server.deployed,
                    server.llm_port
                );
            }
        }
        Command::Status { server } => {
            let snapshot = coordinator.get_server_status(&server)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Test { server } => {
            let ok = coordinator.test_connection(&server).await?;
            let snapshot = coordinator.get_server_status(&server)?;
            match snapshot.error {
                Some(error) if !ok => println!("{}: FAILED ({})", server, error),
                _ => println!("{}: {}", server, if ok { "OK" } else { "FAILED" }),
            }
        }
        Command::Deploy { server } => {
            let snapshot = coordinator.deploy_server(&server).await?;
            println!("{}: deployed on port {}", snapshot.id, snapshot.llm_port);
        }
        Command::Connect { server } => {
            let connection = coordinator.connect_server(&server).await?;
            println!(
                "{}: http://127.0.0.1:{} -> remote port {}",
                server, connection.tunnel.local_port, connection.tunnel.remote_port
            );
            hold_until_interrupted(state, &server).await?;
        }
        Command::EnsureReady { server } => {
            let snapshot = coordinator.ensure_ready(&server).await?;
            if let Some(port) = snapshot.local_port {
                println!("{}: ready at http://127.0.0.1:{}", server, port);
            }
            hold_until_interrupted(state, &server).await?;
        }
        Command::Chat {
            server,
            prompt,
            model,
            system,
        } => {
            coordinator.ensure_ready(&server).await?;
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(prompt));
            let reply = coordinator.chat_with_model(&server, messages, model).await?;
            println!("{}", reply.content);
            if let Some(usage) = reply.usage {
                eprintln!(
                    "[{}] {} prompt + {} completion tokens",
                    reply.model, usage.prompt_tokens, usage.completion_tokens
                );
            }
        }
        Command::Logs { server, lines } => {
            let filter = LogFilter {
                server_id: server,
                ..Default::default()
            };
            for line in state.logs.get_recent_logs(lines, Some(&filter)) {
                println!("{}", serde_json::to_string(&line)?);
            }
        }
    }
    Ok(())
}

async fn hold_until_interrupted(state: &AppState, server: &str) -> anyhow::Result<()> {
    eprintln!("Press Ctrl-C to disconnect");
    tokio::signal::ctrl_c().await?;
    state.coordinator.disconnect_server(server).await?;
    Ok(())
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<EngineEvent>, json: bool) {
    loop {
        match events.recv().await {
            Ok(event) if json => {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{}", line);
                }
            }
            Ok(EngineEvent::Progress {
                server_id,
                step,
                percentage,
                ..
            }) => eprintln!("[{}] {:>3}% {}", server_id, percentage, step),
            Ok(EngineEvent::Log {
                server_id,
                level,
                message,
                ..
            }) => eprintln!("[{}] {}: {}", server_id, level, message),
            Ok(EngineEvent::Health {
                server_id,
                local_port,
                healthy,
            }) if !healthy => eprintln!("[{}] health check failed on port {}", server_id, local_port),
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}
