use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Result fields reported by the processor, passed through to the caller.
pub type ProcessResult = serde_json::Map<String, serde_json::Value>;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ProcessorError {
    #[error("Anki deck {0} does not exist.")]
    DeckNotFound(String),
    #[error("deck processor failed: {0}")]
    Failed(String),
}

/// Everything the processor needs for one run.
#[derive(Clone, PartialEq)]
pub struct RunParameters {
    pub username: String,
    pub password: String,
    pub collection_path: PathBuf,
    pub project_id: String,
    pub deck_name: String,
    pub force: bool,
    pub overwrite_target_fields: bool,
}

impl std::fmt::Debug for RunParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunParameters")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("collection_path", &self.collection_path)
            .field("project_id", &self.project_id)
            .field("deck_name", &self.deck_name)
            .field("force", &self.force)
            .field("overwrite_target_fields", &self.overwrite_target_fields)
            .finish()
    }
}

#[async_trait]
pub trait DeckProcessor: Send + Sync {
    async fn run(&self, params: &RunParameters) -> Result<ProcessResult, ProcessorError>;
}

/// Runs the deck processor as a child process.
///
/// Inputs are passed as `ANKI_*` environment variables so that credentials
/// never show up in the process list. On exit code 0 the processor must print
/// a JSON object to stdout. A dedicated exit code reports an unknown deck;
/// any other exit is a failure.
pub struct CommandDeckProcessor {
    program: String,
    args: Vec<String>,
    deck_not_found_exit_code: i32,
}

impl CommandDeckProcessor {
    pub fn new(program: impl Into<String>, args: Vec<String>, deck_not_found_exit_code: i32) -> Self {
        CommandDeckProcessor {
            program: program.into(),
            args,
            deck_not_found_exit_code,
        }
    }
}

fn flag(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

#[async_trait]
impl DeckProcessor for CommandDeckProcessor {
    async fn run(&self, params: &RunParameters) -> Result<ProcessResult, ProcessorError> {
        tracing::info!(program = %self.program, deck = %params.deck_name, "Running deck processor");

        let output = Command::new(&self.program)
            .args(&self.args)
            .env("ANKI_USERNAME", &params.username)
            .env("ANKI_PASSWORD", &params.password)
            .env("ANKI_COLLECTION_PATH", &params.collection_path)
            .env("ANKI_PROJECT_ID", &params.project_id)
            .env("ANKI_DECK_NAME", &params.deck_name)
            .env("ANKI_FORCE", flag(params.force))
            .env(
                "ANKI_OVERWRITE_TARGET_FIELDS",
                flag(params.overwrite_target_fields),
            )
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ProcessorError::Failed(format!("could not start {}: {e}", self.program)))?;

        match output.status.code() {
            Some(0) => serde_json::from_slice::<ProcessResult>(&output.stdout)
                .map_err(|e| ProcessorError::Failed(format!("invalid processor output: {e}"))),
            Some(code) if code == self.deck_not_found_exit_code => {
                Err(ProcessorError::DeckNotFound(params.deck_name.clone()))
            }
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(ProcessorError::Failed(format!(
                    "processor exited with {}: {}",
                    code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}")),
                    stderr.trim()
                )))
            }
        }
    }
}
