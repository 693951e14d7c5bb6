mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::exit_code_for;
use k2s_addons_core::install_signal_handler;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "k2s", version, about = "K2s addon packaging and offline import")]
struct Cli {
    /// K2s installation directory (defaults to $K2S_INSTALL_DIR, then the current directory).
    #[arg(long, global = true)]
    install_dir: Option<PathBuf>,

    /// Addons config file (defaults to $K2S_ADDONS_CONFIG, then <install>/cfg/addons.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage addons.
    Addons {
        #[command(subcommand)]
        command: AddonsCommand,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum AddonsCommand {
    /// List available addons and their implementations.
    Ls,
    /// Export addons into an OCI artifact for offline installation.
    Export {
        /// Addon to export; all addons when omitted.
        addon: Option<String>,
        /// Implementation of ADDON to export; all of its implementations when omitted.
        implementation: Option<String>,
        /// Directory the artifact is written to.
        #[arg(short, long)]
        dir: PathBuf,
    },
    /// Import addons from an exported artifact.
    Import {
        /// Only import these addons.
        names: Vec<String>,
        /// Artifact file produced by `addons export`.
        #[arg(short, long)]
        zip: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("K2S_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Addons { command } => {
            commands::load_context(cli.install_dir.as_deref(), cli.config.as_deref()).and_then(
                |ctx| match command {
                    AddonsCommand::Ls => commands::ls::run(&ctx, json_output),
                    AddonsCommand::Export {
                        addon,
                        implementation,
                        dir,
                    } => commands::export::run(
                        ctx,
                        addon.as_deref(),
                        implementation.as_deref(),
                        &dir,
                        json_output,
                    ),
                    AddonsCommand::Import { names, zip } => {
                        commands::import::run(&ctx, &names, &zip, json_output)
                    }
                },
            )
        }
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}
