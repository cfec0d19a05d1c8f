//! Interactive live session client.
//!
//! Connects to the agent, then maps keyboard input onto the session:
//! Enter toggles recording, `q` (or Ctrl+C, or end of input) quits.

use crate::audio::CpalDeviceProvider;
use crate::audio::capture::suppress_audio_warnings;
use crate::config::Config;
use crate::error::{Result, VoxliveError};
use crate::session::capture::RecordingState;
use crate::session::envelope::ContextSummary;
use crate::session::orchestrator::{SessionOrchestrator, SessionState};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// How long to wait for the turn end to go out before closing on quit.
const QUIT_DRAIN: Duration = Duration::from_millis(500);

/// Overrides collected from the command line.
#[derive(Debug, Default)]
pub struct LiveOptions {
    pub endpoint: Option<String>,
    pub device: Option<String>,
    pub output_device: Option<String>,
    pub grace: Option<Duration>,
    pub context: Option<PathBuf>,
    pub quiet: bool,
}

impl LiveOptions {
    /// Apply CLI overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(endpoint) = &self.endpoint {
            config.session.endpoint = endpoint.clone();
        }
        if let Some(device) = &self.device {
            config.capture.device = Some(device.clone());
        }
        if let Some(device) = &self.output_device {
            config.playback.device = Some(device.clone());
        }
        if let Some(grace) = self.grace {
            config.capture.turn_complete_grace_ms = grace.as_millis() as u64;
        }
    }
}

/// Run the interactive session until the user quits.
pub async fn run_live_command(mut config: Config, options: LiveOptions) -> Result<()> {
    // Suppress noisy JACK/ALSA warnings before audio init
    suppress_audio_warnings();

    options.apply(&mut config);
    let quiet = options.quiet;

    let context = options
        .context
        .as_deref()
        .map(load_context)
        .transpose()?;

    let provider = Arc::new(CpalDeviceProvider::from_config(&config));
    let session = SessionOrchestrator::new(config, provider)?;
    if let Some(summary) = context {
        session.set_context(summary);
    }

    tracing::info!(
        version = %crate::version_string(),
        endpoint = %session.config().session.endpoint,
        "starting live session"
    );
    if !quiet {
        eprintln!("Connecting to {}...", session.config().session.endpoint);
    }
    session.connect().await?;
    if !quiet {
        eprintln!("{}", "Connected.".green());
        eprintln!("Press Enter to start or stop talking, q to quit.");
    }

    let status = (!quiet).then(|| tokio::spawn(print_status_changes(&session)));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().eq_ignore_ascii_case("q") => break,
                Ok(Some(_)) => {
                    if let Err(e) = toggle(&session) {
                        eprintln!("{} {}", "Error:".red(), e.user_message());
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(VoxliveError::Io(e)),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if !quiet {
        eprintln!("\nShutting down...");
    }
    finish(&session).await;

    if let Some(task) = status {
        task.abort();
    }
    Ok(())
}

/// Toggle recording without stalling the runtime: opening a real
/// microphone blocks for a while.
fn toggle(session: &SessionOrchestrator) -> Result<RecordingState> {
    tokio::task::block_in_place(|| session.toggle_recording())
}

/// Let an active turn end reach the agent, then close.
async fn finish(session: &SessionOrchestrator) {
    if session.recording_state() == RecordingState::Recording
        && session.stop_recording().is_ok()
    {
        let mut recording = session.watch_recording();
        tokio::time::timeout(
            QUIT_DRAIN,
            recording.wait_for(|state| *state == RecordingState::Idle),
        )
        .await
        .ok();
    }
    session.close();
}

/// Print state transitions until the session is dropped.
fn print_status_changes(
    session: &SessionOrchestrator,
) -> impl std::future::Future<Output = ()> + Send + 'static {
    let mut state = session.watch_state();
    let mut recording = session.watch_recording();
    let mut speaking = session.watch_speaking();
    let mut last_error = session.watch_last_error();

    async move {
        loop {
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    match *state.borrow_and_update() {
                        SessionState::Disconnected => eprintln!("{}", "Disconnected.".yellow()),
                        SessionState::Connecting => eprintln!("Reconnecting..."),
                        SessionState::Connected => eprintln!("{}", "Connected.".green()),
                        SessionState::Closing => {}
                    }
                }
                changed = recording.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    match *recording.borrow_and_update() {
                        RecordingState::Recording => eprintln!("{}", "● Recording".red()),
                        RecordingState::Stopping => eprintln!("Finishing turn..."),
                        RecordingState::Idle => eprintln!("{}", "Microphone off.".dimmed()),
                    }
                }
                changed = speaking.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *speaking.borrow_and_update() {
                        eprintln!("{}", "Agent speaking...".cyan());
                    }
                }
                changed = last_error.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let Some(error) = last_error.borrow_and_update().clone() {
                        eprintln!("{} {}", "Error:".red(), error);
                    }
                }
            }
        }
    }
}

/// Load a context summary from a JSON file.
fn load_context(path: &Path) -> Result<ContextSummary> {
    let json = std::fs::read_to_string(path).map_err(|e| {
        VoxliveError::Other(format!("Failed to read context {}: {}", path.display(), e))
    })?;
    ContextSummary::from_json(&json)
}
