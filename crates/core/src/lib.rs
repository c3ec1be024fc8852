pub mod block;
pub mod config;
pub mod error;
pub mod storage;

pub use block::{Block, Column, DataType, Field, Schema, SchemaRef};
pub use config::{ConfigError, ScannerConfig};
pub use error::{ScanError, ScanResult};
pub use storage::StorageType;
