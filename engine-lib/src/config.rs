//! Loads and validates the process wide configuration file. The file is a
//! single JSON document, unknown keys are tolerated, illegal values are fatal
//! before anything starts listening.

use crate::error::{EngineError, EngineResult};
use crate::output_pipeline::OutputPipelineConfig;
use crate::turn_loop::TurnTimings;
use protocol::{QUEUE_DEFAULT_SIZE, TOKEN_LENGTH};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub output_handler: OutputHandlerConfig,
    pub turn_timeout: TurnTimeoutConfig,
    pub client: ClientConfig,
    pub terminal: TerminalConfig,
    pub ui: UiConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OutputHandlerConfig {
    // camelCase would render this as "sendToUi", the file says "sendToUI".
    #[serde(default, rename = "sendToUI")]
    pub send_to_ui: bool,
    /// The UI ticker period in milliseconds.
    #[serde(default = "default_time_interval")]
    pub time_interval: u64,
    #[serde(default)]
    pub send_to_file: bool,
    #[serde(default)]
    pub file_path: PathBuf,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_time_interval() -> u64 {
    100
}

fn default_buffer_size() -> usize {
    256
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TurnTimeoutConfig {
    /// The receive window length in milliseconds.
    pub client_response_time: u64,
    /// The advisory simulation budget in milliseconds.
    pub simulate_timeout: u64,
    /// The fixed turn cadence in milliseconds.
    pub turn_timeout: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub port: u32,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TerminalConfig {
    pub token: String,
    pub port: u32,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UiConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub port: u32,
}

impl ServerConfig {
    pub async fn load(path: impl AsRef<Path>) -> EngineResult<ServerConfig> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .await
            .map_err(|err| EngineError::Config(format!("failed to read {}: {err}", path.display())))?;
        let config: ServerConfig = serde_json::from_str(&raw)
            .map_err(|err| EngineError::Config(format!("failed to parse {}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        check_port(self.client.port, "client.port")?;
        check_port(self.terminal.port, "terminal.port")?;
        check_token(&self.terminal.token, "terminal.token")?;
        if self.ui.enable {
            check_port(self.ui.port, "ui.port")?;
            check_token(&self.ui.token, "ui.token")?;
        }
        if self.output_handler.send_to_ui && self.output_handler.time_interval == 0 {
            return Err(EngineError::Config(
                "outputHandler.timeInterval must be positive when the ui sink is enabled".to_string(),
            ));
        }
        if self.output_handler.send_to_file
            && (self.output_handler.buffer_size == 0
                || self.output_handler.buffer_size > QUEUE_DEFAULT_SIZE)
        {
            return Err(EngineError::Config(format!(
                "outputHandler.bufferSize must be in (0, {QUEUE_DEFAULT_SIZE}]"
            )));
        }
        Ok(())
    }

    pub fn turn_timings(&self) -> TurnTimings {
        TurnTimings {
            client_response_time: Duration::from_millis(self.turn_timeout.client_response_time),
            simulate_timeout: Duration::from_millis(self.turn_timeout.simulate_timeout),
            turn_timeout: Duration::from_millis(self.turn_timeout.turn_timeout),
        }
    }

    pub fn output_pipeline_config(&self) -> OutputPipelineConfig {
        OutputPipelineConfig {
            send_to_ui: self.output_handler.send_to_ui,
            time_interval: Duration::from_millis(self.output_handler.time_interval),
            send_to_file: self.output_handler.send_to_file,
            file_path: self.output_handler.file_path.clone(),
            buffer_size: self.output_handler.buffer_size,
            queue_capacity: QUEUE_DEFAULT_SIZE,
        }
    }
}

fn check_port(port: u32, which: &str) -> EngineResult<()> {
    if port == 0 || port > 65535 {
        return Err(EngineError::Config(format!(
            "{which} must be in (0, 65535], got {port}"
        )));
    }
    Ok(())
}

fn check_token(token: &str, which: &str) -> EngineResult<()> {
    if token.len() != TOKEN_LENGTH || !token.is_ascii() {
        return Err(EngineError::Config(format!(
            "{which} must be {TOKEN_LENGTH} ASCII characters"
        )));
    }
    Ok(())
}
