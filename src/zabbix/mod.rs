pub mod batch;
pub mod emitter;
pub mod sender;

use std::path::PathBuf;
use thiserror::Error;

pub use emitter::BatchEmitter;
pub use sender::ZabbixSender;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("failed to write batch file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("batch file {} does not exist", .0.display())]
    BatchMissing(PathBuf),
    #[error("failed to run {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
}
