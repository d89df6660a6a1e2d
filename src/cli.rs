//! Command-line interface definition for ChatRelay
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands for running the relay server and inspecting
//! stored conversations offline.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// ChatRelay - streaming relay between a chat client and an LLM API
///
/// Serves the chat HTTP endpoints, streams completions as server-sent
/// events, and persists every conversation as JSON on disk.
#[derive(Parser, Debug, Clone)]
#[command(name = "chatrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines instead of human-readable text
    #[arg(long)]
    pub json_logs: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for ChatRelay
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the relay HTTP server
    Serve {
        /// Address to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Directory holding one JSON file per conversation (overrides config)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Inspect stored conversations without starting the server
    History {
        /// History subcommand
        #[command(subcommand)]
        command: HistoryCommand,
    },
}

/// Conversation history subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum HistoryCommand {
    /// List stored conversation ids with their message counts
    List,

    /// Print every message of one conversation
    Show {
        /// Conversation id
        id: String,
    },

    /// Delete a conversation from disk
    Delete {
        /// Conversation id
        id: String,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            verbose: false,
            json_logs: false,
            command: Commands::Serve {
                host: None,
                port: None,
                data_dir: None,
            },
        }
    }
}
