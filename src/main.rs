use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use model_worker_chat::catalog::{Catalog, ModelInfo};
use model_worker_chat::config::AppConfig;
use model_worker_chat::controller::{ChatController, ViewUpdate};
use model_worker_chat::logger::setup_logging;
use model_worker_chat::runtime::mock::MockLoader;
use model_worker_chat::worker::process_manager::ProcessManager;
use model_worker_chat::worker::worker_bridge::WorkerBridge;
use model_worker_chat::worker::worker_main::run_stdio_worker;

#[derive(Parser, Debug)]
#[command(name = "model_chat", version, about = "Chat with small local models")]
struct Cli {
    /// JSON config file; defaults are used when it does not exist
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Model key to load on startup
    #[arg(long)]
    model: Option<String>,

    /// Print the model catalog and exit
    #[arg(long)]
    list_models: bool,

    /// Run the worker as a task in this process instead of a child process
    #[arg(long)]
    in_process: bool,

    /// Run as a stdio worker (used internally by the front end)
    #[arg(long, hide = true)]
    worker: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    if let Err(e) = setup_logging(&config.logging) {
        eprintln!("Failed to set up logging: {e}");
    }
    if !cli.config.exists() {
        info!("Config {} not found, using defaults", cli.config.display());
    }

    let catalog = Catalog::from_config(config.models.as_deref());

    // The stdio worker builds its own runtime, so it must start outside one.
    if cli.worker {
        let loader = Arc::new(MockLoader::new(config.runtime.clone()));
        run_stdio_worker(loader, catalog).context("Worker failed")?;
        return Ok(());
    }

    if cli.list_models {
        print_models(catalog.models(), None);
        return Ok(());
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run_chat(cli, config, catalog))
}

async fn run_chat(cli: Cli, config: AppConfig, catalog: Catalog) -> anyhow::Result<()> {
    let (bridge, mut events) = if cli.in_process {
        let loader = Arc::new(MockLoader::new(config.runtime.clone()));
        WorkerBridge::in_process(loader, catalog.clone())
    } else {
        let process = ProcessManager::spawn(Some(&cli.config))?;
        WorkerBridge::from_process(Arc::new(process))?
    };
    info!("Chat front end started (in_process={})", cli.in_process);

    let mut controller = ChatController::new(catalog, config.generation.clone());
    let mut renderer = Renderer::default();

    print_help();
    if let Some(key) = cli.model.as_deref() {
        select_model(&mut controller, &bridge, key)?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => renderer.render(&controller.apply(event)),
                None => {
                    warn!("Worker event channel closed");
                    break;
                }
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    if handle_line(&mut controller, &bridge, &line)? == Flow::Quit {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => match controller.cancel() {
                Some(request) => bridge.send(request)?,
                None => break,
            },
        }
    }

    bridge.shutdown().await;
    Ok(())
}

fn handle_line(
    controller: &mut ChatController,
    bridge: &WorkerBridge,
    line: &str,
) -> anyhow::Result<Flow> {
    let line = line.trim();
    let (command, arg) = match line.split_once(char::is_whitespace) {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "/quit" | "/exit" => return Ok(Flow::Quit),
        "/help" => print_help(),
        "/models" => print_models(controller.models(), controller.loaded_model()),
        "/model" => select_model(controller, bridge, arg)?,
        "/clear" => {
            controller.clear();
            println!("-- {}", controller.status());
        }
        "/cancel" => match controller.cancel() {
            Some(request) => bridge.send(request)?,
            None => println!("-- Nothing to cancel"),
        },
        other if other.starts_with('/') => println!("-- Unknown command {other}, try /help"),
        _ => match controller.submit(line) {
            Ok(request) => bridge.send(request)?,
            Err(e) => println!("-- {e}"),
        },
    }
    Ok(Flow::Continue)
}

/// Accepts a catalog key or a 1-based index into the list.
fn select_model(
    controller: &mut ChatController,
    bridge: &WorkerBridge,
    choice: &str,
) -> anyhow::Result<()> {
    let key = match choice.parse::<usize>() {
        Ok(index) if index >= 1 => controller
            .models()
            .get(index - 1)
            .map(|m| m.key.clone())
            .unwrap_or_else(|| choice.to_string()),
        _ => choice.to_string(),
    };

    match controller.select_model(Some(&key)) {
        Ok(Some(request)) => bridge.send(request)?,
        Ok(None) => println!("-- {}", controller.status()),
        Err(e) => println!("-- {e}"),
    }
    Ok(())
}

fn print_models(models: &[ModelInfo], loaded: Option<&str>) {
    for (i, model) in models.iter().enumerate() {
        let marker = if loaded == Some(model.key.as_str()) { "*" } else { " " };
        println!(
            "{marker}{:>2}. {} [{}] {} params, {} - {}",
            i + 1,
            model.key,
            model.pipeline,
            model.params,
            model.size,
            model.task
        );
    }
}

fn print_help() {
    println!("Commands:");
    println!("  /models          - List available models");
    println!("  /model <key|n>   - Load a model");
    println!("  /cancel          - Stop the current generation (or Ctrl-C)");
    println!("  /clear           - Clear the conversation");
    println!("  /quit            - Exit");
    println!("Anything else is sent to the loaded model.");
}

/// Draws controller updates on a plain terminal.
#[derive(Default)]
struct Renderer {
    /// Cursor is not at the start of a line.
    mid_line: bool,
    /// Assistant text has been printed for the current generation.
    streamed: bool,
}

impl Renderer {
    fn render(&mut self, updates: &[ViewUpdate]) {
        let mut stdout = std::io::stdout().lock();

        for update in updates {
            match update {
                ViewUpdate::Progress(percent) => {
                    let _ = write!(stdout, "\rLoading model: {percent:>3}%");
                    self.mid_line = true;
                }
                ViewUpdate::Status(status) => {
                    self.end_line(&mut stdout);
                    let _ = writeln!(stdout, "-- {status}");
                }
                ViewUpdate::AppendOutput(text) => {
                    let _ = write!(stdout, "{text}");
                    self.mid_line = true;
                    self.streamed = true;
                }
                ViewUpdate::ReplaceOutput(text) => {
                    if self.streamed {
                        self.end_line(&mut stdout);
                    }
                    let _ = write!(stdout, "{text}");
                    self.mid_line = true;
                    self.streamed = true;
                }
                ViewUpdate::InputEnabled => {
                    self.end_line(&mut stdout);
                    self.streamed = false;
                }
            }
        }
        let _ = stdout.flush();
    }

    fn end_line<W: Write>(&mut self, out: &mut W) {
        if self.mid_line {
            let _ = writeln!(out);
            self.mid_line = false;
        }
    }
}
