use thiserror::Error;

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),
}
