//! Native job-runner events → canonical session events.
//!
//! Stateless. The run coordinator calls [`translate`] once per native event
//! and acts on the returned [`Signal`].

use crate::errors::TranslateError;

use super::models::{EventPayload, InstructionArg, NativeEvent};

/// Info text recorded when a run finishes successfully.
pub const RUN_SUCCEEDED_INFO: &str = "Network run successfully";

/// What the coordinator should do after this event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Continue,
    /// Execution error: finalize the run as failed.
    Fatal,
    Finished { success: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub event: Option<EventPayload>,
    pub signal: Signal,
}

impl Translation {
    fn emit(event: EventPayload) -> Self {
        Self {
            event: Some(event),
            signal: Signal::Continue,
        }
    }

    fn skip() -> Self {
        Self {
            event: None,
            signal: Signal::Continue,
        }
    }
}

pub fn translate(native: &NativeEvent) -> Result<Translation, TranslateError> {
    let translation = match native {
        NativeEvent::Progress {
            step_info,
            current_step,
            total_steps,
        } => match step_info.first() {
            Some(info) => Translation::emit(EventPayload::Progress {
                info: info.clone(),
                current_step: Some(*current_step),
                total_steps: Some(*total_steps),
            }),
            None => Translation::skip(),
        },
        NativeEvent::Instruction {
            name,
            executable,
            arguments,
        } => Translation::emit(EventPayload::Instruction {
            name: name.clone(),
            instruction: executable.clone(),
            arguments: encode_arguments(arguments)?,
        }),
        NativeEvent::InstructionResult { serialized_result } => {
            Translation::emit(EventPayload::Result {
                info: serialized_result.clone(),
            })
        }
        NativeEvent::Info { message } => Translation::emit(EventPayload::Log {
            info: message.clone(),
        }),
        NativeEvent::Warning { message } => {
            tracing::warn!(warning = %message, "job runner warning");
            Translation::skip()
        }
        NativeEvent::Error { message } => {
            tracing::error!(error = %message, "error during job execution");
            Translation {
                event: Some(EventPayload::error(message)),
                signal: Signal::Fatal,
            }
        }
        NativeEvent::RunFinished { success: true, .. } => Translation {
            event: Some(EventPayload::Progress {
                info: RUN_SUCCEEDED_INFO.to_string(),
                current_step: None,
                total_steps: None,
            }),
            signal: Signal::Finished { success: true },
        },
        NativeEvent::RunFinished {
            success: false,
            output,
        } => {
            tracing::warn!(output = ?output, "job failed to complete");
            Translation {
                event: None,
                signal: Signal::Finished { success: false },
            }
        }
        NativeEvent::Unknown => {
            tracing::debug!("unrecognized native event kind");
            Translation::skip()
        }
    };
    Ok(translation)
}

/// Arguments become `[{"name": .., "value": ..}]`. Values that are JSON are
/// decoded; anything else (e.g. Starlark literals) stays a string.
fn encode_arguments(arguments: &[InstructionArg]) -> Result<serde_json::Value, TranslateError> {
    let encoded: Vec<serde_json::Value> = arguments
        .iter()
        .map(|arg| {
            let value = serde_json::from_str::<serde_json::Value>(&arg.serialized_value)
                .unwrap_or_else(|_| serde_json::Value::String(arg.serialized_value.clone()));
            serde_json::json!({ "name": arg.name, "value": value })
        })
        .collect();
    serde_json::to_value(encoded).map_err(|source| TranslateError::Encode {
        kind: "instruction",
        source,
    })
}
