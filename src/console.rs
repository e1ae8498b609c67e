//! # Operator Console
//!
//! Line-oriented administration of a running relay server:
//!
//! | Command            | Effect                                      |
//! |--------------------|---------------------------------------------|
//! | `list`             | registered nicknames and their addresses    |
//! | `zombies`          | addresses whose peer vanished               |
//! | `kick <nick>`      | terminate the connection holding `nick`     |
//! | `kill <host:port>` | terminate the connection at that address    |
//! | `stop`             | stop the server                             |
//! | `help`             | print the command table                     |
//!
//! End of input behaves like `stop`.

use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;

use colored::Colorize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

use crate::registry::{ConnectionRegistry, ConnectionState};

/// Parsed console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Zombies,
    Kick(Option<String>),
    Kill(Option<String>),
    Stop,
    Help,
}

/// Input that names no known command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unrecognized command: {}", self.0)
    }
}

const HELP: &[(&str, &str)] = &[
    ("list", "list registered nicks"),
    ("zombies", "list zombie connections"),
    ("kick <nick>", "kick the given nick from the server"),
    ("kill <host:port>", "kill the connection at the given address"),
    ("stop", "stop the server"),
    ("help", "display this message"),
];

impl Command {
    /// Parse one input line; `None` for a blank line
    pub fn parse(line: &str) -> Option<Result<Self, UnknownCommand>> {
        let mut words = line.split_whitespace();
        let name = words.next()?;
        let arg = words.next().map(str::to_string);

        Some(match name {
            "list" => Ok(Command::List),
            "zombies" => Ok(Command::Zombies),
            "kick" => Ok(Command::Kick(arg)),
            "kill" => Ok(Command::Kill(arg)),
            "stop" => Ok(Command::Stop),
            "help" => Ok(Command::Help),
            other => Err(UnknownCommand(other.to_string())),
        })
    }
}

/// Callback that brings the server down
pub type StopHook = Box<dyn Fn() + Send + Sync>;

pub struct Console {
    registry: ConnectionRegistry,
    stop: StopHook,
}

impl Console {
    pub fn new(registry: ConnectionRegistry, stop: StopHook) -> Self {
        Self { registry, stop }
    }

    /// Execute one line, writing the outcome to `out`
    ///
    /// Returns false once the console should exit.
    pub fn dispatch<W: Write>(&self, line: &str, out: &mut W) -> io::Result<bool> {
        let command = match Command::parse(line) {
            None => return Ok(true),
            Some(Ok(command)) => command,
            Some(Err(unknown)) => {
                writeln!(out, "{}", unknown.to_string().red())?;
                return Ok(true);
            }
        };

        match command {
            Command::List => self.list(out)?,
            Command::Zombies => self.zombies(out)?,
            Command::Kick(nick) => self.kick(nick.as_deref(), out)?,
            Command::Kill(addr) => self.kill(addr.as_deref(), out)?,
            Command::Help => help(out)?,
            Command::Stop => {
                info!("Stop requested from console");
                (self.stop)();
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Read commands until `stop` or end of input
    pub async fn run<R, W>(&self, reader: R, mut out: W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        let mut lines = reader.lines();
        loop {
            write!(out, ">> ")?;
            out.flush()?;

            let Some(line) = lines.next_line().await? else {
                info!("Console input closed");
                (self.stop)();
                return Ok(());
            };
            if !self.dispatch(&line, &mut out)? {
                return Ok(());
            }
        }
    }

    fn list<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "{}", "Registered nicks".bold())?;
        writeln!(out, "================")?;
        for (nick, addr) in self.registry.nicknames() {
            writeln!(out, "{} - {}", nick.green(), addr)?;
        }
        Ok(())
    }

    fn zombies<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "{}", "Zombie connections".bold())?;
        writeln!(out, "==================")?;
        for addr in self.registry.zombies() {
            writeln!(out, "{}", addr.to_string().yellow())?;
        }
        Ok(())
    }

    fn kick<W: Write>(&self, nick: Option<&str>, out: &mut W) -> io::Result<()> {
        let Some(nick) = nick else {
            return writeln!(out, "Kick command requires a nick");
        };

        match self.registry.lookup_by_nickname(nick) {
            Some(connection) => {
                self.registry.terminate(&connection);
                warn!("Operator kicked {}", connection.addr());
                writeln!(out, "{} kicked from server", nick)
            }
            None => writeln!(out, "{} is not a registered nick", nick),
        }
    }

    fn kill<W: Write>(&self, addr: Option<&str>, out: &mut W) -> io::Result<()> {
        let Some(addr) = addr else {
            return writeln!(out, "Kill command requires an address");
        };

        let connection = addr
            .parse::<SocketAddr>()
            .ok()
            .and_then(|parsed| self.registry.lookup_by_address(&parsed));

        match connection {
            Some(connection) => {
                let was = connection.state();
                self.registry.terminate(&connection);
                if was != ConnectionState::Zombie {
                    warn!("Operator killed live connection {}", connection.addr());
                }
                writeln!(out, "{} killed", addr)
            }
            None => writeln!(out, "{} is not a zombie", addr),
        }
    }
}

fn help<W: Write>(out: &mut W) -> io::Result<()> {
    writeln!(out, "Available commands:")?;
    for (usage, description) in HELP {
        writeln!(out, "    {:<18} {}", usage, description)?;
    }
    Ok(())
}
