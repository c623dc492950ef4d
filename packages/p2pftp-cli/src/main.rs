//! Terminal client for p2pftp.
//!
//! Registers with the signaling server, prints the assigned token and a
//! shareable connect link, then runs a line-oriented loop: slash commands
//! drive the session, anything else is chat.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use p2pftp_core::config::DEFAULT_MAX_CHUNK_SIZE;
use p2pftp_core::{CoreEvent, EventSink, PeerSession, SessionConfig, TransferDirection};

#[derive(Parser)]
#[command(
    name = "p2pftp",
    about = "Peer-to-peer file transfer and chat over WebRTC data channels"
)]
struct Args {
    /// Signaling server: host, host:port, or URL. A ?token= query
    /// prefills /connect.
    server: String,

    /// Directory incoming files are written to.
    #[arg(long, default_value = ".")]
    download_dir: PathBuf,

    /// Advertised maximum chunk size in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_CHUNK_SIZE)]
    max_chunk_size: u32,
}

const HELP: &str = "\
commands:
  /connect <token>   dial the peer with that token
  /accept <token>    accept a peer's connection request
  /send <filepath>   send a file to the connected peer
  /link              print a shareable connect link
  /help              this text
  /quit              exit
anything else is sent as a chat message";

fn render(event: &CoreEvent) {
    match event {
        CoreEvent::TokenAssigned { token } => println!("* your token: {token}"),
        CoreEvent::PeerRequest { token } => {
            println!("* peer {token} wants to connect; type /accept {token}")
        }
        CoreEvent::ChatMessage { content } => println!("peer: {content}"),
        CoreEvent::StatusUpdate { message } => println!("* {message}"),
        CoreEvent::TransferProgress { direction, completed, total, succeeded, failed } => {
            match direction {
                TransferDirection::Send => {
                    println!("[send] {completed}/{total} (ok {succeeded}, failed {failed})")
                }
                TransferDirection::Receive => println!("[recv] {completed}/{total}"),
            }
        }
        CoreEvent::TransferDone { direction, name, size } => match direction {
            TransferDirection::Send => println!("* sent {name} ({size} bytes)"),
            TransferDirection::Receive => println!("* received {name} ({size} bytes)"),
        },
        CoreEvent::RawControl { payload } => {
            debug!(len = payload.len(), "unhandled control payload");
        }
        CoreEvent::Error { kind, detail } => println!("! {kind}: {detail}"),
    }
}

async fn handle_line(session: &PeerSession, line: &str) -> Option<ExitCode> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    if !command.starts_with('/') {
        match session.send_chat(line).await {
            Ok(()) => println!("me: {line}"),
            Err(e) => println!("! {}: {e}", e.kind()),
        }
        return None;
    }

    match command {
        "/connect" if !rest.is_empty() => {
            if let Err(e) = session.connect(rest).await {
                println!("! {}: {e}", e.kind());
            }
        }
        "/accept" if !rest.is_empty() => {
            if let Err(e) = session.accept(rest).await {
                println!("! {}: {e}", e.kind());
            }
        }
        "/send" if !rest.is_empty() => {
            if let Err(e) = session.send_file(std::path::Path::new(rest)).await {
                println!("! {}: {e}", e.kind());
            }
        }
        "/link" => match session.share_link() {
            Some(link) => println!("* share this link: {link}"),
            None => println!("! not registered yet"),
        },
        "/help" => println!("{HELP}"),
        "/quit" => {
            session.close().await;
            return Some(ExitCode::SUCCESS);
        }
        _ => println!("unknown command; {HELP}"),
    }
    None
}

#[tokio::main]
async fn main() -> color_eyre::Result<ExitCode> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = SessionConfig {
        server: args.server,
        download_dir: args.download_dir,
        max_chunk_size: args.max_chunk_size,
        ..SessionConfig::default()
    };

    let (sink, mut events) = EventSink::new();
    let session = PeerSession::new(config, sink);

    if let Err(e) = session.register().await {
        eprintln!("! {}: {e}", e.kind());
        return Ok(ExitCode::from(1));
    }
    if let Some(link) = session.share_link() {
        println!("* share this link: {link}");
    }
    if let Some(peer) = session.prefill_token() {
        println!("* link carried a peer token; type /connect {peer}");
    }
    println!("* type /help for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                // Session-fatal errors (peer rejection, capability
                // timeout, session closed) end the process with exit 1.
                let fatal = matches!(
                    &event,
                    CoreEvent::Error { kind, .. } if kind.is_session_fatal()
                );
                render(&event);
                if fatal {
                    return Ok(ExitCode::from(1));
                }
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if let Some(code) = handle_line(&session, &line).await {
                            return Ok(code);
                        }
                    }
                    None => {
                        // stdin closed
                        session.close().await;
                        return Ok(ExitCode::SUCCESS);
                    }
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
