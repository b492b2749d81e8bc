/*!
 * virtmgmt CLI
 *
 * Offline helpers around the object model: canonicalize object paths,
 * preview the WQL the locator and event layers generate, and manage the
 * configuration file.
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use virtmgmt::{
    config::{LogLevel, ModelConfig},
    logging, query,
};
use virtmgmt_core_interface::{EventKind, ObjectPath};

#[derive(Parser)]
#[command(name = "virtmgmt")]
#[command(
    version,
    about = "Inspect object paths and generated queries for virtualization management",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, value_enum, default_value = "warn", global = true)]
    log_level: LogLevelArg,

    /// Path to log file (default: stdout)
    #[arg(long, value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Path to config file
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse an object path and print its canonical form
    Path {
        /// Path such as \\HOST\root\virtualization\v2:Msvm_ComputerSystem.Name="x"
        path: String,
    },

    /// Print the batched WQL for a property filter
    Query {
        /// Class to select from
        #[arg(long = "class")]
        class_name: String,

        /// Property to filter on
        #[arg(long, default_value = "ElementName")]
        property: String,

        /// Values to match (repeatable)
        #[arg(long = "value")]
        values: Vec<String>,

        /// Treat *, ? and [ literally
        #[arg(long)]
        no_wildcards: bool,
    },

    /// Print the event subscription query for an object
    Event {
        /// Event kind
        #[arg(long, value_enum, default_value = "modified")]
        kind: EventKindArg,

        /// Object path to watch
        path: String,
    },

    /// Configuration file operations
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write the default configuration
    Init {
        file: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show { file: Option<PathBuf> },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EventKindArg {
    Created,
    Modified,
    Deleted,
}

impl From<EventKindArg> for EventKind {
    fn from(arg: EventKindArg) -> Self {
        match arg {
            EventKindArg::Created => EventKind::Created,
            EventKindArg::Modified => EventKind::Modified,
            EventKindArg::Deleted => EventKind::Deleted,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ModelConfig> {
    match path {
        Some(path) => ModelConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(ModelConfig::default()),
    }
}

fn parse_path(text: &str) -> Result<ObjectPath> {
    text.parse()
        .with_context(|| format!("'{}' is not a valid object path", text))
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_ref())?;
    config.log_level = cli.log_level.into();
    config.log_file = cli.log.clone();
    logging::init_logging(&config)?;

    match cli.command {
        Commands::Path { path } => {
            let path = parse_path(&path)?;
            println!("{}", path);
            println!("server:    {}", path.server());
            println!("namespace: {}", path.namespace());
            println!("class:     {}", path.class_name());
            if path.is_class() {
                println!("kind:      class reference");
            } else {
                println!("kind:      instance");
                for (name, value) in path.keys() {
                    println!("key:       {} = {}", name, value);
                }
            }
        }

        Commands::Query {
            class_name,
            property,
            values,
            no_wildcards,
        } => {
            let filters: Vec<String> = values
                .iter()
                .map(|value| query::filter(&property, value, !no_wildcards))
                .collect();
            for text in query::batched_select(&class_name, &filters, config.max_query_length) {
                println!("{}", text);
            }
        }

        Commands::Event { kind, path } => {
            let path = parse_path(&path)?;
            let within = Duration::from_secs(config.event_within_secs);
            println!(
                "{}",
                query::event_query(kind.into(), &path, within, Vec::<String>::new())
            );
        }

        Commands::Config(ConfigCommands::Init { file, force }) => {
            if file.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", file.display());
            }
            ModelConfig::default().to_file(&file)?;
            println!("Wrote default configuration to {}", file.display());
        }

        Commands::Config(ConfigCommands::Show { file }) => {
            let shown = match file {
                Some(file) => load_config(Some(&file))?,
                None => config,
            };
            let text = toml::to_string_pretty(&shown).context("serializing configuration")?;
            print!("{}", text);
        }
    }

    Ok(())
}
