//! Voice Loop entry point.
//!
//! Communicates with the front end via JSON-line IPC on stdin/stdout. Builds
//! the backend client, microphone and output driver from config, then hands
//! control to the turn controller until `stop` or stdin closes.

use std::sync::Arc;

use tracing::{error, info};

use voice_loop::audio::CpalMicrophone;
use voice_loop::backend::HttpBackend;
use voice_loop::config::{get_config_path, read_voice_loop_config};
use voice_loop::controller::{ControllerSettings, TurnController};
use voice_loop::ipc::bridge::{emit_error, emit_event, spawn_stdin_reader, StdoutSink};
use voice_loop::ipc::VoiceEvent;
use voice_loop::logging;
use voice_loop::playback::RodioOutput;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    // Emit starting event immediately so the front end knows we're alive.
    emit_event(&VoiceEvent::Starting {});

    let config = read_voice_loop_config();
    info!(path = %get_config_path().display(), ?config, "Configuration loaded");
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        emit_error("InvalidConfig", &e);
        anyhow::bail!("{} rejected: {}", get_config_path().display(), e);
    }

    let backend = HttpBackend::from_config(&config);
    let microphone = CpalMicrophone::new(config.input_device.clone());
    let output = RodioOutput::new(config.output_device.clone(), config.playback_volume);

    let mut controller = TurnController::new(
        ControllerSettings::from(&config),
        Arc::new(backend),
        Box::new(microphone),
        Box::new(output),
        Arc::new(StdoutSink),
    );

    let commands = spawn_stdin_reader();

    emit_event(&VoiceEvent::Ready {});
    info!(backend = %config.backend_url, "Voice loop ready");

    controller.run(commands).await;

    emit_event(&VoiceEvent::Stopping {});
    info!("Voice loop shutting down");
    Ok(())
}
