//! Self-upgrade for an installed service: find the next release, check the
//! install tree, back it up, swap the code and patch the data.

pub mod archive;
pub mod backup;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod manifest;
pub mod networking;
pub mod patcher;
pub mod preflight;
pub mod release;
pub mod replacer;
pub mod storage;

pub use config::UpgradeConfig;
pub use engine::Upgrader;
pub use error::{Result, UpgradeError};
