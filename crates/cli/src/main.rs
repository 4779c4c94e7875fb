//! weft - corpus-processing pipeline engine.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod arbiter;
mod commands;
mod logging;

use commands::{
  cmd_autocomplete, cmd_build_models, cmd_classes, cmd_clean, cmd_config, cmd_create_file, cmd_files, cmd_install,
  cmd_languages, cmd_modules, cmd_plugins, cmd_preload_start, cmd_preload_status, cmd_preload_stop, cmd_presets,
  cmd_run, cmd_run_rule, cmd_schema, cmd_setup, ModuleFilter, RunOptions,
};
use logging::{init_cli_logging, init_run_logging};

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Annotate and export text corpora with a declarative pipeline")]
#[command(version)]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Annotate the corpus and produce the requested exports
  Run {
    /// Rule names or output files to produce (default: the default exports)
    targets: Vec<String>,
    /// Number of parallel jobs
    #[arg(short, long)]
    jobs: Option<usize>,
    /// Use a running preloader on this socket
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Fail or block instead of falling back when the preloader refuses
    #[arg(long)]
    force_preloader: bool,
    /// Leave the processor registry out of the content keys
    #[arg(long)]
    no_registry_key: bool,
  },
  /// Run the installers listed in the corpus config (or the given ones)
  Install {
    targets: Vec<String>,
    #[arg(short, long)]
    jobs: Option<usize>,
  },
  /// Run the uninstallers listed in the corpus config (or the given ones)
  Uninstall {
    targets: Vec<String>,
    #[arg(short, long)]
    jobs: Option<usize>,
  },
  /// Remove the work directory (and optionally exports and logs)
  Clean {
    /// Remove work directory, exports and logs
    #[arg(long)]
    all: bool,
    /// Also remove the export directory
    #[arg(long)]
    export: bool,
    /// Also remove the log directory
    #[arg(long)]
    logs: bool,
  },
  /// Show the effective configuration (or one key)
  Config { key: Option<String> },
  /// List the source files of the corpus
  Files,
  /// List available modules and their processors
  Modules {
    #[arg(long)]
    annotators: bool,
    #[arg(long)]
    importers: bool,
    #[arg(long)]
    exporters: bool,
  },
  /// List annotation presets available for the corpus language
  Presets,
  /// Show the effective class bindings
  Classes,
  /// List languages supported by the available processors
  Languages,
  /// Set up the data directory
  Setup {
    /// Data directory location
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Forget the configured data directory
    #[arg(long)]
    reset: bool,
  },
  /// Build models used by the pipeline
  BuildModels {
    /// Build every model, not only those the corpus needs
    #[arg(long)]
    all: bool,
    /// Restrict to models for one language
    #[arg(long)]
    language: Option<String>,
  },
  /// Manage plugin registrations
  Plugins {
    #[command(subcommand)]
    command: PluginCommand,
  },
  /// Run one named rule
  RunRule { targets: Vec<String> },
  /// Produce specific files in the work or export directory
  CreateFile { files: Vec<String> },
  /// Control the preloader
  Preload {
    #[command(subcommand)]
    command: PreloadCommand,
  },
  /// Refresh the shell-completion cache
  Autocomplete,
  /// Print the JSON schema for corpus configuration files
  Schema,
}

#[derive(Subcommand)]
enum PluginCommand {
  /// Register a plugin crate
  Install { name: String },
  /// Unregister a plugin crate
  Uninstall { name: String },
  /// List registered plugins
  List,
}

#[derive(Subcommand)]
enum PreloadCommand {
  /// Start the preloader and serve until stopped
  Start {
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Workers per preloaded processor
    #[arg(long, default_value_t = 1)]
    processes: usize,
  },
  /// Stop a running preloader
  Stop {
    #[arg(long)]
    socket: Option<PathBuf>,
  },
  /// Show preloader worker utilisation
  Status {
    #[arg(long)]
    socket: Option<PathBuf>,
  },
}

#[tokio::main]
async fn main() -> ExitCode {
  let cli = Cli::parse();

  // Long-running commands also log to the corpus log directory
  let _guard = match &cli.command {
    Commands::Run { .. } | Commands::Install { .. } | Commands::Uninstall { .. } | Commands::Preload { .. } => {
      init_run_logging()
    }
    _ => {
      init_cli_logging();
      None
    }
  };

  let result = dispatch(cli.command).await;

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      let user_error = e
        .downcast_ref::<weft_core::Error>()
        .is_none_or(weft_core::Error::is_user_error);
      eprintln!("error: {e:#}");
      if user_error {
        ExitCode::from(1)
      } else {
        // Internal failures leave a detailed trace next to the corpus
        if let Some(trace_file) = logging::write_error_trace(&e) {
          eprintln!("a detailed trace was written to {}", trace_file.display());
        }
        ExitCode::from(2)
      }
    }
  }
}

async fn dispatch(command: Commands) -> anyhow::Result<()> {
  match command {
    Commands::Run {
      targets,
      jobs,
      socket,
      force_preloader,
      no_registry_key,
    } => {
      cmd_run(
        targets,
        RunOptions {
          jobs,
          socket,
          force_preloader,
          use_registry_key: !no_registry_key,
        },
      )
      .await
    }
    Commands::Install { targets, jobs } => cmd_install(targets, jobs, false).await,
    Commands::Uninstall { targets, jobs } => cmd_install(targets, jobs, true).await,
    Commands::Clean { all, export, logs } => cmd_clean(all, export, logs),
    Commands::Config { key } => cmd_config(key.as_deref()),
    Commands::Files => cmd_files(),
    Commands::Modules {
      annotators,
      importers,
      exporters,
    } => cmd_modules(ModuleFilter {
      annotators,
      importers,
      exporters,
    }),
    Commands::Presets => cmd_presets(),
    Commands::Classes => cmd_classes(),
    Commands::Languages => cmd_languages(),
    Commands::Setup { dir, reset } => cmd_setup(dir, reset),
    Commands::BuildModels { all, language } => cmd_build_models(all, language).await,
    Commands::Plugins { command } => match command {
      PluginCommand::Install { name } => cmd_plugins("install", Some(&name)),
      PluginCommand::Uninstall { name } => cmd_plugins("uninstall", Some(&name)),
      PluginCommand::List => cmd_plugins("list", None),
    },
    Commands::RunRule { targets } => cmd_run_rule(targets).await,
    Commands::CreateFile { files } => cmd_create_file(files).await,
    Commands::Preload { command } => match command {
      PreloadCommand::Start { socket, processes } => cmd_preload_start(socket, processes).await,
      PreloadCommand::Stop { socket } => cmd_preload_stop(socket).await,
      PreloadCommand::Status { socket } => cmd_preload_status(socket).await,
    },
    Commands::Autocomplete => cmd_autocomplete(),
    Commands::Schema => cmd_schema(),
  }
}
