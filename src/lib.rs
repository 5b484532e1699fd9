//! cmd2s3 Library
//!
//! Streams the output of a shell command into an S3 object with a
//! bounded-memory multipart upload.
//!
//! # Features
//!
//! - **Bounded Memory**: At most `queue_depth` parts are buffered ahead of the upload
//! - **Unknown Size**: No need to know how much the command will produce
//! - **Exit-Aware**: A command that fails never results in a committed object
//! - **All or Nothing**: Every failure aborts the multipart upload
//!
//! # Example
//!
//! ```no_run
//! use cmd2s3::config::Config;
//! use cmd2s3::process::ShellCommand;
//! use cmd2s3::s3::{parse_s3_url, S3Client};
//! use cmd2s3::upload::stream_to_storage;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let target = parse_s3_url("s3://backups/etc.tar")?;
//!     let cancel = CancellationToken::new();
//!
//!     let output = ShellCommand::new("tar -c /etc").spawn(cancel.clone())?;
//!     let storage = Arc::new(S3Client::from_config(&config.s3).await);
//!     let summary =
//!         stream_to_storage(output, storage, &target, &config.upload_settings()?, &cancel).await?;
//!     println!("Uploaded {} bytes in {} parts", summary.bytes, summary.parts);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod logging;
pub mod metrics;
pub mod process;
pub mod s3;
pub mod storage;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use storage::{MultipartStorage, ObjectTarget};
pub use upload::{stream_to_storage, UploadError, UploadSettings, UploadSummary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
