pub mod cmd;
pub mod config;
pub mod engine;
mod error;
pub mod paths;
pub mod process;
pub mod progress;
pub mod status;
pub mod tools;
pub mod tracks;
pub mod ytdlp;

pub use error::{EngineError, Result};
