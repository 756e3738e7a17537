//! iproto-cli - one-shot commands against an iproto data store.

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use iproto_client::ConnectionConfig;
use iproto_protocol::IteratorType;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "iproto-cli")]
#[command(about = "Command-line interface for iproto data stores")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:3301")]
    addr: String,

    /// User name
    #[arg(short, long, env = "IPROTO_USER")]
    user: Option<String>,

    /// Password
    #[arg(short, long, env = "IPROTO_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Request timeout in milliseconds
    #[arg(long, default_value = "30000")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Ping the server
    Ping,

    /// Show the server greeting
    Info,

    /// Evaluate an expression on the server
    Eval {
        /// Expression source
        expr: String,

        /// Arguments as JSON values; anything else is sent as a string
        args: Vec<String>,
    },

    /// Call a stored function
    Call {
        /// Function name
        function: String,

        /// Arguments as JSON values; anything else is sent as a string
        args: Vec<String>,
    },

    /// Select tuples from a space
    Select {
        /// Space id
        space: u32,

        /// Key as a JSON array
        #[arg(default_value = "[]")]
        key: String,

        /// Index id
        #[arg(short, long, default_value = "0")]
        index: u32,

        /// Maximum tuples to return
        #[arg(short, long)]
        limit: Option<u32>,

        /// Tuples to skip
        #[arg(short, long, default_value = "0")]
        offset: u32,

        /// Index iterator
        #[arg(long, value_enum, default_value = "eq")]
        iterator: IteratorArg,
    },

    /// Ask the server for its replication ballot
    Vote,
}

#[derive(Clone, Copy, ValueEnum)]
pub(crate) enum IteratorArg {
    Eq,
    Req,
    All,
    Lt,
    Le,
    Ge,
    Gt,
}

impl From<IteratorArg> for IteratorType {
    fn from(it: IteratorArg) -> Self {
        match it {
            IteratorArg::Eq => IteratorType::Eq,
            IteratorArg::Req => IteratorType::Req,
            IteratorArg::All => IteratorType::All,
            IteratorArg::Lt => IteratorType::Lt,
            IteratorArg::Le => IteratorType::Le,
            IteratorArg::Ge => IteratorType::Ge,
            IteratorArg::Gt => IteratorType::Gt,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = ConnectionConfig::new(cli.addr.clone())
        .with_request_timeout(Duration::from_millis(cli.timeout));
    match (cli.user, cli.password) {
        (Some(user), password) => {
            config = config.with_credentials(user, password.unwrap_or_default());
        }
        (None, Some(_)) => {
            eprintln!("{}: --password requires --user", "Error".red());
            std::process::exit(1);
        }
        (None, None) => {}
    }

    match commands::execute(config, cli.command).await {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
