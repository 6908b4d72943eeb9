use std::{fs::read_to_string, str::FromStr};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use service::registry::ChannelRange;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Mailbox {
    ///
    /// mailbox number
    ///
    /// The single mailbox used on every local port. Exactly one mailbox
    /// pair is driven per port, there is no striping across mailboxes.
    ///
    #[serde(default = "Mailbox::number")]
    pub number: u8,
}

impl Mailbox {
    fn number() -> u8 {
        1
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self {
            number: Self::number(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Rings {
    ///
    /// outbound ring capacity
    ///
    /// Must be a power of two. Data submissions beyond a full ring are
    /// refused, control submissions are parked on the deferred queue.
    ///
    #[serde(default = "Rings::size")]
    pub tx: usize,
    ///
    /// inbound pool and per-channel receive ring capacity
    ///
    #[serde(default = "Rings::size")]
    pub rx: usize,
}

impl Rings {
    fn size() -> usize {
        128
    }
}

impl Default for Rings {
    fn default() -> Self {
        Self {
            tx: Self::size(),
            rx: Self::size(),
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Channels {
    ///
    /// dynamic channel number range
    ///
    /// Channel numbers handed out when a creation request does not name an
    /// exact number. Numbers below the range stay reserved for explicit
    /// requests.
    ///
    #[serde(default)]
    pub dynamic_range: ChannelRange,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Timeouts {
    ///
    /// connect timeout in milliseconds
    ///
    /// How long an outgoing connect waits for the remote acknowledgement
    /// before rolling the channel back to idle.
    ///
    #[serde(default = "Timeouts::connect_ms")]
    pub connect_ms: u64,
}

impl Timeouts {
    fn connect_ms() -> u64 {
        3000
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_ms: Self::connect_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub mailbox: Mailbox,
    #[serde(default)]
    pub rings: Rings,
    #[serde(default)]
    pub channel: Channels,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: --config /etc/chanmux/config.json
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => serde_json5::from_str(&read_to_string(&path)?)?,
            None => Self::default(),
        })
    }
}
