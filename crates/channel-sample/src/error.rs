use channel_fabric::FabricError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("No connection to {0}")]
    ConnectTimeout(String),
    #[error("Command failed: {0}")]
    Command(String),
    #[error(transparent)]
    Fabric(#[from] FabricError),
}
