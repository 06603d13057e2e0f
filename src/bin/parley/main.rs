use std::io::{BufRead, Write};
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use parley::audio::CpalBackend;
use parley::config::Config;
use parley::error::ParleyError;
use parley::persona::{Persona, PersonaRegistry};
use parley::session::{
    Command as SessionCommand, ConnectionState, SessionManager, SessionSettings, SessionStatus,
};
use parley::transport::gemini::GeminiTransport;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Talk to a real-time voice agent",
    long_about = "Parley holds a live spoken conversation with a remote real-time speech \
        model. Microphone audio is streamed to the service as it is captured, the \
        agent's voice is played back without gaps, and the agent stops talking as \
        soon as you interrupt it. Several personas with their own voice and \
        instructions are available and can be switched between calls."
)]
struct Cli {
    /// Path to config file
    ///
    /// Defaults to ~/.config/parley/config.yaml if not specified. Built-in
    /// defaults are used when the default file does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    ///
    /// Sets the log level to debug for the parley crate, showing session
    /// state changes, scheduling decisions and capture statistics.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start an interactive call (foreground)
    ///
    /// Opens the microphone and speakers and reads commands from stdin:
    /// press Enter to start or end the call, `persona <id>` to switch
    /// persona, `quit` to exit. The API key is read from the environment
    /// variable named in the config (GEMINI_API_KEY by default) every time
    /// a call starts.
    Call {
        /// Persona to talk to first (defaults to session.default_persona)
        #[arg(long, short)]
        persona: Option<String>,
    },

    /// List available personas
    Personas,

    /// List audio input and output devices
    ///
    /// Shows every device recognized by the system. Put a name into
    /// audio.input_device or audio.output_device to use it instead of the
    /// default.
    Devices,

    /// Generate shell completions
    ///
    /// Prints a completion script for the given shell to stdout.
    /// Source or install the output to enable tab completion.
    Completions {
        /// Shell to generate completions for (bash, zsh, fish, elvish, powershell)
        shell: Shell,
    },
}

fn load_config(cli: &Cli) -> Result<Config, ParleyError> {
    match &cli.config {
        Some(path) => Config::load(path),
        None => Config::load_default(),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("parley=debug,info")
    } else {
        EnvFilter::new("parley=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    install_completions_if_missing();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = run(cli);
    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

/// Auto-install shell completions for `$SHELL` if the completion file does not
/// already exist. Errors are ignored so that missing dirs or unsupported
/// shells never block normal operation.
fn install_completions_if_missing() {
    let Ok(shell_env) = std::env::var("SHELL") else {
        return;
    };

    let Some(home) = dirs::home_dir() else {
        return;
    };

    let (shell, path) = if shell_env.ends_with("/bash") {
        let dir = home.join(".local/share/bash-completion/completions");
        (Shell::Bash, dir.join("parley"))
    } else if shell_env.ends_with("/zsh") {
        (Shell::Zsh, home.join(".zfunc/_parley"))
    } else if shell_env.ends_with("/fish") {
        (Shell::Fish, home.join(".config/fish/completions/parley.fish"))
    } else {
        return;
    };

    if path.exists() {
        return;
    }

    if let Some(parent) = path.parent()
        && std::fs::create_dir_all(parent).is_err()
    {
        return;
    }

    let mut buf = Vec::new();
    generate(shell, &mut Cli::command(), "parley", &mut buf);

    let _ = std::fs::write(&path, buf);
}

fn run(cli: Cli) -> Result<(), ParleyError> {
    match cli.command {
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "parley", &mut std::io::stdout());
            Ok(())
        }
        Command::Devices => run_devices(),
        Command::Personas => {
            let config = load_config(&cli)?;
            run_personas(&config)
        }
        Command::Call { ref persona } => {
            let config = load_config(&cli)?;
            run_call(&config, persona.as_deref())
        }
    }
}

fn print_device_list(devices: &[String], default_name: Option<&str>) {
    for (i, name) in devices.iter().enumerate() {
        let marker = if default_name == Some(name.as_str()) {
            " (default)"
        } else {
            ""
        };
        println!("  {}: {name}{marker}", i + 1);
    }
}

fn run_devices() -> Result<(), ParleyError> {
    let inputs = parley::audio::list_input_devices()?;
    let outputs = parley::audio::list_output_devices()?;

    if inputs.is_empty() {
        println!("No audio input devices found.");
    } else {
        println!("Input devices:");
        print_device_list(&inputs, parley::audio::default_input_device_name().as_deref());
    }

    println!();

    if outputs.is_empty() {
        println!("No audio output devices found.");
    } else {
        println!("Output devices:");
        print_device_list(&outputs, parley::audio::default_output_device_name().as_deref());
    }

    Ok(())
}

fn run_personas(config: &Config) -> Result<(), ParleyError> {
    let registry = PersonaRegistry::new(&config.personas)?;
    for persona in registry.iter() {
        let marker = if persona.id == config.session.default_persona {
            " (default)"
        } else {
            ""
        };
        println!("{}{marker}", persona.id);
        println!("  {}, {} (voice {})", persona.name, persona.role, persona.voice);
        if !persona.description.is_empty() {
            println!("  {}", persona.description);
        }
        if !persona.capabilities.is_empty() {
            println!("  {}", persona.capabilities.join(" · "));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// parley call
// ---------------------------------------------------------------------------

const CALL_HELP: &str = "Commands: <Enter> start/end call, start, stop, persona <id>, personas, quit";

fn run_call(config: &Config, persona: Option<&str>) -> Result<(), ParleyError> {
    let registry = PersonaRegistry::new(&config.personas)?;
    let persona = persona.unwrap_or(&config.session.default_persona);

    let manager = SessionManager::new(
        GeminiTransport::new(&config.remote),
        CpalBackend::new(config.audio.clone()),
        registry.clone(),
        persona,
        SessionSettings::from_config(config),
    )?;

    if let Some(selected) = registry.get(&manager.status().persona) {
        introduce(selected);
    }
    println!("{CALL_HELP}");

    let status = manager.subscribe();
    let (tx, rx) = mpsc::channel(16);
    spawn_command_reader(tx.clone(), registry.clone())?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let printer = tokio::spawn(print_status(status, registry));
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(SessionCommand::Shutdown).await;
            }
        });

        // cpal streams are not Send, so the manager runs on this task.
        manager.run(rx).await;

        interrupt.abort();
        printer.abort();
    });

    println!();
    Ok(())
}

fn introduce(persona: &Persona) {
    println!();
    println!("Talking to {}, {}", persona.name, persona.role);
    if !persona.suggestions.is_empty() {
        println!("Try asking:");
        for suggestion in &persona.suggestions {
            println!("  \"{suggestion}\"");
        }
    }
    println!();
}

/// Read call commands from stdin on a plain thread. EOF ends the call.
fn spawn_command_reader(
    tx: mpsc::Sender<SessionCommand>,
    registry: PersonaRegistry,
) -> Result<(), ParleyError> {
    std::thread::Builder::new()
        .name("parley-stdin".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                let command = match parse_command(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => {
                        list_personas(&registry);
                        continue;
                    }
                    Err(msg) => {
                        println!("{msg}");
                        println!("{CALL_HELP}");
                        continue;
                    }
                };
                let quit = command == SessionCommand::Shutdown;
                if tx.blocking_send(command).is_err() || quit {
                    return;
                }
            }
            let _ = tx.blocking_send(SessionCommand::Shutdown);
        })?;
    Ok(())
}

/// `Ok(None)` asks for the persona list.
fn parse_command(line: &str) -> Result<Option<SessionCommand>, String> {
    let mut words = line.split_whitespace();
    let command = match words.next() {
        None | Some("t" | "toggle") => SessionCommand::Toggle,
        Some("start") => SessionCommand::Start,
        Some("stop") => SessionCommand::Stop,
        Some("q" | "quit" | "exit") => SessionCommand::Shutdown,
        Some("personas") => return Ok(None),
        Some("p" | "persona") => match words.next() {
            Some(id) => SessionCommand::SwitchPersona(id.to_string()),
            None => return Err("usage: persona <id>".to_string()),
        },
        Some(other) => return Err(format!("unknown command: {other}")),
    };
    Ok(Some(command))
}

fn list_personas(registry: &PersonaRegistry) {
    for persona in registry.iter() {
        println!("  {:<12} {}, {}", persona.id, persona.name, persona.role);
    }
}

async fn print_status(mut status: watch::Receiver<SessionStatus>, registry: PersonaRegistry) {
    let mut last = status.borrow_and_update().clone();

    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();

        if current.persona != last.persona
            && let Some(persona) = registry.get(&current.persona)
        {
            introduce(persona);
        }

        if current.state != last.state {
            println!("\r{:<40}", current.state.to_string());
            if current.state == ConnectionState::Connected {
                println!("Speak now. Press Enter to end the call.");
            }
        }

        if current.error != last.error
            && let Some(error) = &current.error
        {
            println!("{error}");
        }

        if current.state == ConnectionState::Connected {
            print!("\r{}", meter(current.volume));
            let _ = std::io::stdout().flush();
        }

        last = current;
    }
}

fn meter(volume: f32) -> String {
    const WIDTH: usize = 30;
    let filled = ((volume.clamp(0.0, 1.0) * WIDTH as f32).round() as usize).min(WIDTH);
    format!("[{}{}]", "#".repeat(filled), " ".repeat(WIDTH - filled))
}
