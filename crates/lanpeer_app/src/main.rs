mod logging;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use lanpeer_net::{NetworkConfig, NodeEvent, PeerNode};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// `~/.lanpeer`, home of the config file and the logs.
pub(crate) fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Cannot determine home directory")?;
    Ok(home.join(".lanpeer"))
}

/// First CLI argument, else `~/.lanpeer/config.json`.
fn config_path() -> Result<PathBuf> {
    match std::env::args_os().nth(1) {
        Some(path) => Ok(PathBuf::from(path)),
        None => Ok(base_dir()?.join("config.json")),
    }
}

/// Load the config, writing the defaults out when no file exists yet.
fn load_config(path: &Path) -> NetworkConfig {
    let config = NetworkConfig::load_or_default(path);
    if !path.exists() {
        match config.save_to_file(path) {
            Ok(()) => info!("Wrote default config to {}", path.display()),
            Err(e) => warn!("Cannot write default config: {e}"),
        }
    }
    config
}

// ---------------------------------------------------------------------------
// Terminal commands
// ---------------------------------------------------------------------------

const HELP: &str = "* /peers lists peers, /quit exits, anything else is sent to everyone";

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Quit,
    Peers,
    Help,
    Say(&'a str),
    Nothing,
}

fn parse_command(line: &str) -> Command<'_> {
    let trimmed = line.trim();
    match trimmed {
        "" => Command::Nothing,
        "/quit" | "/exit" => Command::Quit,
        "/peers" => Command::Peers,
        "/help" => Command::Help,
        _ => Command::Say(trimmed),
    }
}

fn format_event(event: &NodeEvent) -> String {
    match event {
        NodeEvent::PeerJoined(peer) => format!("* {peer} joined"),
        NodeEvent::PeerLeft(peer) => format!("* {peer} left"),
        NodeEvent::MessageReceived { from, text } => format!("<{}> {text}", from.name),
    }
}

fn print_peers(node: &PeerNode) {
    let peers = node.peers();
    if peers.is_empty() {
        println!("* no peers connected");
        return;
    }
    for peer in peers {
        println!(
            "* {} (since {})",
            peer.identity,
            peer.connected_at.format("%H:%M:%S")
        );
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = match logging::init_logging() {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Logging disabled: {e}");
            None
        }
    };

    let path = config_path()?;
    let config = load_config(&path);

    let mut node = PeerNode::new(config);
    let mut events = node
        .start()
        .await?
        .context("Node was already running")?;

    if let Some(nickname) = node.nickname() {
        println!("* you are {nickname}; type /help for commands");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Command::Quit => break,
                    Command::Peers => print_peers(&node),
                    Command::Help => println!("{HELP}"),
                    Command::Say(text) => {
                        let sent = node.send_to_all_peers(text)?;
                        if sent == 0 {
                            println!("* nobody to send to yet");
                        }
                    }
                    Command::Nothing => {}
                }
            }
            event = events.recv() => match event {
                Some(event) => println!("{}", format_event(&event)),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    node.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanpeer_net::PeerIdentity;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("/quit"), Command::Quit);
        assert_eq!(parse_command(" /peers "), Command::Peers);
        assert_eq!(parse_command("   "), Command::Nothing);
        assert_eq!(parse_command(" hello there "), Command::Say("hello there"));
        assert_eq!(parse_command("/unknown"), Command::Say("/unknown"));
    }

    #[test]
    fn test_format_event() {
        let peer = PeerIdentity::new("Jane", "10.0.0.9:5123".parse().unwrap());
        assert_eq!(
            format_event(&NodeEvent::PeerJoined(peer.clone())),
            "* Jane@10.0.0.9:5123 joined"
        );
        assert_eq!(
            format_event(&NodeEvent::MessageReceived {
                from: peer,
                text: "hi".into()
            }),
            "<Jane> hi"
        );
    }

    #[test]
    fn test_load_config_writes_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sub").join("config.json");

        let config = load_config(&path);
        assert!(path.exists());
        assert_eq!(config.discovery_port, lanpeer_net::config::DEFAULT_DISCOVERY_PORT);

        let reloaded = NetworkConfig::load_or_default(&path);
        assert_eq!(reloaded.stall_timeout, config.stall_timeout);
    }
}
