use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::actions::AuthType;
use crate::core::models::AgentType;

#[derive(Parser, Debug, Clone)]
#[command(name = "sentinel-live", version, about = "Live dashboard for multi-agent security scans")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose human output
    #[arg(short = 'v', long = "verbose", action = ArgAction::SetTrue, global = true)]
    pub verbose: bool,

    /// Debug logs (implies verbose)
    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue, global = true)]
    pub debug: bool,

    /// Configuration file (default: sentinel.yaml in the usual places)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Follow a run live until it finishes
    Watch(WatchArgs),

    /// Fetch a run once and print its metrics
    Summary {
        run_id: String,

        /// Print metrics as JSON
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },

    /// Show one agent's summary, findings, screenshots and log for a run
    Agent {
        run_id: String,

        /// Agent tag or class name, e.g. `sqli` or `SQLiAgent`
        agent: AgentType,
    },

    /// Show one finding with its evidence and screenshots
    Finding { run_id: String, finding_id: String },

    /// Start a new scan
    Start(StartArgs),

    /// Cancel a running scan
    Cancel { run_id: String },

    /// Start a new scan with the target, agents and configuration of a prior one
    Rerun {
        run_id: String,

        /// Follow the new run live
        #[arg(long, action = ArgAction::SetTrue)]
        watch: bool,
    },

    /// Stream the generated report of a run to stdout
    Report { run_id: String },

    /// Play a scripted scenario through the live dashboard, offline
    Replay {
        scenario: PathBuf,

        #[arg(long = "no-clear", action = ArgAction::SetTrue)]
        no_clear: bool,
    },

    /// Write a default configuration file
    InitConfig {
        #[arg(default_value = "sentinel.yaml")]
        path: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    pub run_id: String,

    /// JSON-lines change feed to merge with polling, `-` for stdin
    #[arg(long, value_name = "PATH")]
    pub updates: Option<String>,

    /// Append frames instead of redrawing the screen
    #[arg(long = "no-clear", action = ArgAction::SetTrue)]
    pub no_clear: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    /// URL of the application to scan
    #[arg(short = 't', long = "target")]
    pub target: String,

    /// Agent to deploy, repeatable (default: all)
    #[arg(short = 'a', long = "agent", value_name = "AGENT")]
    pub agents: Vec<AgentType>,

    #[arg(long = "auth-type", value_enum, default_value_t = AuthType::None)]
    pub auth_type: AuthType,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    #[arg(long)]
    pub token: Option<String>,

    /// Free-form guidance passed to the agents
    #[arg(long)]
    pub instructions: Option<String>,

    /// Follow the new run live
    #[arg(long, action = ArgAction::SetTrue)]
    pub watch: bool,
}
