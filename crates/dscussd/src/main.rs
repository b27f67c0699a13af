//! dscussd - Dscuss peer-to-peer discussion node daemon
//!
//! Parses one CLI invocation, drives a [`Node`] through it, and exits
//! with the contractual code: 0 on clean shutdown, 1 on startup failure.
//! The interactive `>` prompt and command-line dispatch loop a full REPL
//! front-end would add are the out-of-scope collaborator this binary hands
//! off to; each invocation here is self-contained.

use clap::Parser;
use dscussd::{Cli, Command, Node, NodeEvent, NodeSettings};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("dscussd=info".parse().unwrap()))
        .init();

    let cli = Cli::parse();
    info!("dscussd v{} - Dscuss node", env!("CARGO_PKG_VERSION"));

    let settings = NodeSettings::default();
    if let Err(e) = settings.validate() {
        error!("invalid configuration: {e:#}");
        return ExitCode::FAILURE;
    }

    let mut node = Node::init(cli.data_dir, settings);

    match cli.command {
        Command::Register { nickname, info: bio } => {
            match node.register(&nickname, bio.unwrap_or_default()).await {
                Ok(()) => {
                    info!(nickname, "registered");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("registration failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Login { nickname } => run_login(&mut node, &nickname).await,
        Command::Logout => {
            // Each invocation is its own process, so there is never a
            // session to tear down here.
            warn!("logout has no effect outside an active `login` invocation");
            ExitCode::SUCCESS
        }
        Command::Lspeer => {
            warn!("lspeer has no effect outside an active `login` invocation");
            ExitCode::SUCCESS
        }
        Command::Help { command } => {
            print_help(command.as_deref());
            ExitCode::SUCCESS
        }
    }
}

/// Log in, relay entities to the log until Ctrl-C, then log out cleanly.
async fn run_login(node: &mut Node, nickname: &str) -> ExitCode {
    let mut events = match node.login(nickname).await {
        Ok(events) => events,
        Err(e) => {
            error!("login failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(nickname, "logged in, listening for events (ctrl-c to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
            event = events.recv() => {
                match event {
                    Some(NodeEvent::Message(msg)) => {
                        info!(subject = %msg.subject, author = %msg.author_id, "new message");
                    }
                    Some(NodeEvent::User(user)) => {
                        info!(nickname = %user.nickname, id = %user.id(), "new user");
                    }
                    Some(NodeEvent::OperationIgnored) => {}
                    None => {
                        warn!("event stream closed");
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = node.logout().await {
        error!("logout failed: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn print_help(command: Option<&str>) {
    match command {
        None => println!(
            "commands: register <nickname> [info], login <nickname>, logout, lspeer, help [command]"
        ),
        Some("register") => println!("register <nickname> [info] - create a new local identity"),
        Some("login") => println!("login <nickname> - log in and run the node until interrupted"),
        Some("logout") => println!("logout - tear down the active session"),
        Some("lspeer") => println!("lspeer - list currently connected peers"),
        Some(other) => println!("no such command: {other}"),
    }
}
