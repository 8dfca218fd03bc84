use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use koda_call::config::ClientConfig;
use koda_call::protocol::UserIdentity;
use koda_call::rtc::RtcTransportFactory;
use koda_call::{CallEngine, CallHandle, Notice, channel};

const USAGE: &str = "commands: call <user> | answer | hangup | quit";

#[derive(Parser, Debug)]
#[command(name = "koda-call", about = "One-to-one calls through a Koda relay")]
struct Cli {
    /// Name to log in with; others call you by it
    #[arg(long, env = "KODA_CALL_USER")]
    name: String,
    /// Relay host, overrides KODA_RELAY_HOST
    #[arg(long, value_name = "HOST[:PORT]")]
    relay: Option<String>,
    /// Connect with wss://
    #[arg(long)]
    secure: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env has to be loaded before clap looks at KODA_CALL_USER
    let mut config = ClientConfig::from_env()?;
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("koda_call=info")))
        .init();

    if let Some(relay) = cli.relay {
        config.relay_host = relay;
    }
    config.secure |= cli.secure;
    let identity = UserIdentity::parse(&cli.name)?;

    let transports = Arc::new(RtcTransportFactory::new(config.ice_servers.clone()));
    let (engine, handle, mut notices) = CallEngine::new(identity.clone(), Arc::new(config.media), transports);
    let engine_task = tokio::spawn(engine.run());

    let relay_task = channel::connect(&config, identity.as_str(), handle.event_sender())
        .await
        .context("connecting to relay")?;

    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            print_notice(&notice);
        }
    });

    println!("Logged in as {identity}. {USAGE}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !dispatch(&handle, &line)? {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // Hang up before the relay goes away
    handle.shutdown()?;
    engine_task.await?;
    relay_task.abort();
    Ok(())
}

fn dispatch(handle: &CallHandle, line: &str) -> Result<bool> {
    let mut words = line.split_whitespace();
    match (words.next(), words.next()) {
        (None, _) => {}
        (Some("call"), Some(user)) => handle.dial(user)?,
        (Some("answer"), None) => handle.accept()?,
        (Some("hangup"), None) => handle.hang_up()?,
        (Some("quit"), None) => return Ok(false),
        _ => println!("{USAGE}"),
    }
    Ok(true)
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::ChannelOpened => println!("Connected to relay"),
        Notice::ChannelClosed => println!("Relay connection closed"),
        Notice::RelayMessage(message) => println!("Relay: {message}"),
        Notice::Incoming { caller } => println!("Incoming call from {caller}, type `answer` to pick up"),
        Notice::Connected { remote } => println!("In call with {remote}"),
        Notice::RemoteTrack { kind, .. } => println!("Receiving {kind}"),
        Notice::Failed { error } => println!("Call failed: {error}"),
        Notice::Ended { remote, reason } => println!("Call with {remote} ended ({reason:?})"),
    }
}
