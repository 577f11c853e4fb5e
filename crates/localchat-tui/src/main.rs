use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use localchat_core::{capability, driver, Config, InferenceEngine, LoadError, Model, OllamaEngine, Session};

mod app;
mod handler;
mod oneshot;
mod tui;
mod ui;

use app::App;
use tui::EventHandler;

#[derive(Parser)]
#[command(name = "localchat")]
#[command(version, about = "Chat with a language model running on your own GPU")]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Ollama server URL
    #[arg(long, global = true)]
    ollama_url: Option<String>,

    /// Model to select at startup
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Where the interactive UI writes its log
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ask a single question and stream the answer to stdout
    Ask {
        /// Your question
        question: String,
    },
    /// List the model catalog and which models are already downloaded
    Models,
    /// Check whether this machine can run models on its GPU
    Probe,
}

fn log_filter(verbose: bool) -> EnvFilter {
    let default = if verbose {
        "localchat=debug,localchat_core=debug"
    } else {
        "localchat=info,localchat_core=info"
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into())
}

/// The terminal belongs to the UI, so logs go to a file.
fn init_file_logging(path: &Path, verbose: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

fn init_stderr_logging(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn default_log_path() -> Result<PathBuf> {
    let cache_dir = dirs::cache_dir()
        .ok_or_else(|| anyhow!("Could not determine cache directory"))?;
    Ok(cache_dir.join("localchat").join("localchat.log"))
}

/// Flag beats config file beats the catalog default.
fn resolve_model(flag: Option<&str>, config: &Config) -> Result<Model> {
    match flag {
        Some(id) => Model::from_str(id).ok_or_else(|| LoadError::UnknownModel(id.to_string()).into()),
        None => Ok(config.model().unwrap_or(Model::DEFAULT)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::get_config_path()?,
    };
    let mut config = Config::load_from(&config_path)?;
    if let Some(url) = cli.ollama_url {
        config.ollama_url = url;
    }
    let model = resolve_model(cli.model.as_deref(), &config)?;

    match cli.command {
        Some(command) => {
            init_stderr_logging(cli.verbose);
            oneshot::run(command, &config, model).await
        }
        None => {
            let log_path = match cli.log_file {
                Some(path) => path,
                None => default_log_path()?,
            };
            init_file_logging(&log_path, cli.verbose)?;
            info!("localchat v{}", env!("CARGO_PKG_VERSION"));
            run_tui(config, config_path, model).await
        }
    }
}

async fn run_tui(config: Config, config_path: PathBuf, model: Model) -> Result<()> {
    info!(url = %config.ollama_url, model = %model, "starting interactive session");
    let engine: Arc<dyn InferenceEngine> = Arc::new(OllamaEngine::new(&config.ollama_url));
    let session = Session::new(model, config.chat_params());

    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let mut events = EventHandler::new();

    driver::spawn_probe(capability::default_host(), events.sender());
    let mut app = App::new(session, engine, events.sender(), config_path);

    let result = run_loop(&mut terminal, &mut app, &mut events).await;
    tui::restore()?;

    if let Some(handle) = app.shutdown() {
        let _ = driver::spawn_unload(handle).await;
    }
    result
}

async fn run_loop(terminal: &mut tui::Tui, app: &mut App, events: &mut EventHandler) -> Result<()> {
    while !app.should_quit {
        terminal.draw(|frame| ui::render(app, frame))?;

        match events.next().await {
            Some(event) => handler::handle_event(app, event)?,
            None => break,
        }
    }
    Ok(())
}
