use std::io::IsTerminal;

use clap::{Parser, Subcommand};

use corral_cli::commands::{self, NewSessionOptions};

#[derive(Parser)]
#[command(name = "corral", about = "Supervise a fleet of tmux-based coding-agent sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a session and start its agent
    New {
        /// Unique session title
        title: String,

        /// Host repository the session works on
        #[arg(long, default_value = ".")]
        path: String,

        /// Program to run in the pane (default from config)
        #[arg(long)]
        program: Option<String>,

        /// Automatically confirm agent prompts
        #[arg(long)]
        auto_yes: bool,

        /// Initial prompt delivered to the agent
        #[arg(long)]
        prompt: Option<String>,
    },

    /// List sessions
    Ls,

    /// Attach the terminal to a session's pane
    Attach { title: String },

    /// Print a snapshot of a session's pane
    Peek {
        title: String,

        /// Include the full scrollback history
        #[arg(long)]
        history: bool,

        #[arg(long, default_value_t = 120)]
        width: u16,

        #[arg(long, default_value_t = 40)]
        height: u16,
    },

    /// Pause a session: commit, detach the pane, remove the worktree
    Pause { title: String },

    /// Resume a paused session
    Resume { title: String },

    /// Kill a session and delete it from storage
    Kill { title: String },

    /// Kill all sessions and clear storage
    Reset,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::New {
            title,
            path,
            program,
            auto_yes,
            prompt,
        } => {
            commands::new_session(NewSessionOptions {
                title,
                path,
                program,
                auto_yes,
                prompt,
            })
            .await
        }
        Commands::Ls => commands::list_sessions().await,
        Commands::Attach { title } => commands::attach_session(&title).await,
        Commands::Peek {
            title,
            history,
            width,
            height,
        } => commands::peek_session(&title, history, width, height).await,
        Commands::Pause { title } => commands::pause_session(&title).await,
        Commands::Resume { title } => commands::resume_session(&title).await,
        Commands::Kill { title } => commands::kill_session(&title).await,
        Commands::Reset => commands::reset_sessions().await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
