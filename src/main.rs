use anyhow::Result;
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use voxlive::app::{LiveOptions, run_live_command};
use voxlive::audio::capture::{list_input_devices, list_output_devices};
use voxlive::cli::{Cli, Commands, ConfigAction};
use voxlive::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);

    match cli.command {
        None => {
            let config = load_config(cli.config.as_deref())?;
            let options = LiveOptions {
                endpoint: cli.endpoint,
                device: cli.device,
                output_device: cli.output_device,
                grace: cli.grace,
                context: cli.context,
                quiet: cli.quiet,
            };
            run_live_command(config, options).await?;
        }
        Some(Commands::Devices) => {
            list_audio_devices()?;
        }
        Some(Commands::Config { action }) => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Some(Commands::Completions { shell }) => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "voxlive",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// Install the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level follows -q / -v / -vv.
fn init_logging(quiet: bool, verbose: u8) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, _) => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("voxlive={}", level).into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/voxlive/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&std::path::Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        Config::load(path)?
    } else {
        Config::load_or_default(&Config::default_path())?
    };

    Ok(config.with_env_overrides())
}

/// List available audio input and output devices.
fn list_audio_devices() -> Result<()> {
    let inputs = list_input_devices()?;
    let outputs = list_output_devices()?;

    if inputs.is_empty() && outputs.is_empty() {
        eprintln!("No audio devices found");
        std::process::exit(1);
    }

    println!("Available audio input devices:");
    for (idx, device) in inputs.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }
    println!("Available audio output devices:");
    for (idx, device) in outputs.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }

    Ok(())
}

/// Handle configuration commands.
fn handle_config_command(
    action: ConfigAction,
    custom_path: Option<&std::path::Path>,
) -> Result<()> {
    let config_path = custom_path
        .map(std::path::PathBuf::from)
        .unwrap_or_else(Config::default_path);

    match action {
        ConfigAction::Show => {
            let config = Config::load_or_default(&config_path)?.with_env_overrides();
            if let Err(e) = config.validate() {
                eprintln!("{} {}", "Warning:".yellow(), e);
            }
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Path => {
            println!("{}", config_path.display());
        }
        ConfigAction::Init { force } => {
            Config::write_default(&config_path, force)?;
            println!("Wrote {}", config_path.display());
        }
    }
    Ok(())
}
