//! # telepipe-core
//!
//! Device-resident telemetry pipeline: batch events in memory, stage them
//! durably on disk, and ship them to a remote collector over HTTP.
//!
//! This library provides:
//! - A batching channel that turns typed payloads into JSON envelopes
//! - A file-backed staging store with backpressure and in-flight tracking
//! - A delivery sender with a concurrency cap and retry classification
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! ```text
//! producer ─log()─► Channel ─batch─► StagingStore ◄─claim/delete/release─ Sender ─POST─► collector
//!                      └────────── trigger_send() ─────────────────────────┘
//! ```
//!
//! Telemetry never fails the host: runtime errors are logged and absorbed.
//!
//! ## Example
//!
//! ```rust,no_run
//! use telepipe_core::{Config, ContextTags, CustomEvent, Pipeline};
//!
//! # async fn run() -> telepipe_core::Result<()> {
//! let config = Config::load()?;
//! let pipeline = Pipeline::start(&config.pipeline)?;
//!
//! pipeline.log(&CustomEvent::new("app_started"), ContextTags::new());
//!
//! pipeline.shutdown();
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use channel::Channel;
pub use config::{Config, PipelineConfig};
pub use envelope::{ContextProvider, ContextTags, CustomEvent, Envelope, TelemetryData};
pub use error::{Error, Result};
pub use pipeline::Pipeline;
pub use sender::{SendOutcome, Sender, SenderConfig};
pub use staging::{StagedUnit, StagingStore};
pub use stats::StatsSnapshot;

// Public modules
pub mod channel;
pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod sender;
pub mod staging;
pub mod stats;
