//! CLI entry and dispatch.

use anyhow::{Context, Result};
use aman_core::config;
use aman_core::core::interrupt;
use aman_core::logging;
use clap::Parser;

mod commands;

#[derive(Parser)]
#[command(name = "aman")]
#[command(version)]
#[command(about = "Terminal client for the AMAN mode-driven assistant")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Select (and save) a model before running the command
    #[arg(long, global = true, env = "AMAN_MODEL", value_name = "ID")]
    model: Option<String>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Start an interactive chat (default)
    Chat {
        /// Session to resume by id or id prefix (default: most recent)
        #[arg(long, value_name = "SESSION_ID")]
        session: Option<String>,
    },
    /// Manage saved sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Inspect and select models
    Models {
        #[command(subcommand)]
        command: ModelsCommands,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum SessionCommands {
    /// Lists sessions, most recently active first
    List,
    /// Shows a session transcript
    Show {
        /// Session id or unique id prefix
        #[arg(value_name = "SESSION_ID")]
        id: String,
        /// Print the stored JSON form instead of a transcript
        #[arg(long)]
        json: bool,
    },
    /// Deletes a session
    Delete {
        /// Session id or unique id prefix
        #[arg(value_name = "SESSION_ID")]
        id: String,
    },
    /// Deletes ALL sessions
    Clear {
        /// Confirm deleting every session
        #[arg(long)]
        yes: bool,
    },
}

#[derive(clap::Subcommand)]
enum ModelsCommands {
    /// Lists the models offered by the service
    List,
    /// Selects the model sent with commands
    Set {
        #[arg(value_name = "MODEL_ID")]
        id: String,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let _logging = match logging::init_logging() {
        Ok(handle) => Some(handle),
        Err(err) => {
            eprintln!("Warning: logging disabled: {err:#}");
            None
        }
    };
    // A second Ctrl+C exits without unwinding; flush the log file first.
    interrupt::set_restore_hook(logging::flush);
    interrupt::init()?;

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    let result = rt.block_on(async move { dispatch(cli).await });
    // A stdin read may still be parked on a blocking thread.
    rt.shutdown_background();
    result
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config = config::Config::load().context("load config")?;

    if let Some(model) = cli.model.as_deref() {
        commands::models::set(&config, model)?;
    }

    let Some(command) = cli.command else {
        return commands::chat::run(&config, None).await;
    };

    match command {
        Commands::Chat { session } => commands::chat::run(&config, session.as_deref()).await,

        Commands::Sessions { command } => match command {
            SessionCommands::List => commands::sessions::list(&config),
            SessionCommands::Show { id, json } => commands::sessions::show(&config, &id, json),
            SessionCommands::Delete { id } => commands::sessions::delete(&config, &id),
            SessionCommands::Clear { yes } => commands::sessions::clear(&config, yes),
        },

        Commands::Models { command } => match command {
            ModelsCommands::List => commands::models::list(&config).await,
            ModelsCommands::Set { id } => commands::models::set(&config, &id),
        },

        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
        },
    }
}
