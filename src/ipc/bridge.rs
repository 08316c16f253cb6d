//! IPC bridge: stdin reader and stdout event emitter.
//!
//! A blocking stdin reader thread sends deserialized commands through an
//! mpsc channel; events are written to stdout as JSON lines.

use std::io::{self, BufRead, Write};

use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{EventSink, VoiceCommand, VoiceEvent};

/// Emit a `VoiceEvent` as a JSON line on stdout and flush.
pub fn emit_event(event: &VoiceEvent) {
    let json = match serde_json::to_string(event) {
        Ok(j) => j,
        Err(e) => {
            error!("Failed to serialize event: {}", e);
            return;
        }
    };
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    // Pipe may be closed; nothing to do about it here.
    let _ = writeln!(handle, "{}", json);
    let _ = handle.flush();
}

/// Convenience helper for emitting protocol errors.
pub fn emit_error(kind: &str, message: &str) {
    emit_event(&VoiceEvent::Error {
        kind: kind.to_string(),
        message: message.to_string(),
    });
}

/// `EventSink` that writes JSON lines to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSink;

impl EventSink for StdoutSink {
    fn emit(&self, event: VoiceEvent) {
        emit_event(&event);
    }
}

/// Normalize incoming JSON: if it has a `"type"` field but no `"command"`
/// field, rename `"type"` to `"command"` so serde can deserialize it.
fn normalize_command_json(input: &str) -> String {
    if let Ok(mut obj) = serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(input)
    {
        if !obj.contains_key("command") {
            if let Some(type_val) = obj.remove("type") {
                obj.insert("command".to_string(), type_val);
                if let Ok(json) = serde_json::to_string(&obj) {
                    return json;
                }
            }
        }
    }
    input.to_string()
}

/// Parse one stdin line into a command.
pub fn parse_command(line: &str) -> Result<VoiceCommand, serde_json::Error> {
    serde_json::from_str(&normalize_command_json(line.trim()))
}

/// Spawn a blocking thread that reads JSON lines from stdin, deserializes
/// them into `VoiceCommand`, and forwards them through the returned channel.
///
/// The thread exits when stdin is closed (parent process gone) or on
/// unrecoverable read error.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<VoiceCommand> {
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        let reader = stdin.lock();
        for line in reader.lines() {
            match line {
                Ok(text) => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    match parse_command(&text) {
                        Ok(cmd) => {
                            debug!(?cmd, "Received command");
                            if tx.send(cmd).is_err() {
                                break; // Controller is gone.
                            }
                        }
                        Err(e) => {
                            error!(input = %text.trim(), "Invalid JSON command: {}", e);
                            emit_error("InvalidCommand", &format!("Invalid JSON command: {}", e));
                        }
                    }
                }
                Err(e) => {
                    error!("stdin read error: {}", e);
                    break;
                }
            }
        }
        debug!("stdin reader thread exiting");
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_field_is_accepted_as_command() {
        assert_eq!(
            parse_command(r#"{"type": "system_speak", "text": "Bonjour"}"#).unwrap(),
            VoiceCommand::SystemSpeak {
                text: "Bonjour".into()
            }
        );
    }

    #[test]
    fn test_command_field_wins_over_type() {
        assert_eq!(
            parse_command(r#"{"command": "ping", "type": "ignored"}"#).unwrap(),
            VoiceCommand::Ping {}
        );
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(parse_command("not json").is_err());
    }
}
