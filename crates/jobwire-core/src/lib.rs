//! Jobwire - auto-reconnecting job tracking client.
//!
//! A [`Client`] keeps a job's state in sync with a remote tracking service and
//! lets that service call back into local [`Controller`]s. All protocol state
//! lives on one worker thread; the handle only sends it commands.
//!
//! # Example
//!
//! ```rust,ignore
//! use jobwire::{ActionTable, Client, ClientOptions, JobOutcome, UserSelection};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> jobwire::Result<()> {
//!     let options = ClientOptions::from_env(&UserSelection::default())?;
//!     let client = Client::connect(options)?;
//!     client.wait_for_connect().await;
//!
//!     client.patch("title", "training run");
//!     let _ = client
//!         .register_controller("echo", ActionTable::new().action("echo", 1, |args| {
//!             Ok(args.into_iter().next().unwrap_or_default())
//!         }))
//!         .await?;
//!
//!     client.patch("iteration", 1);
//!     client.shutdown(JobOutcome::Done).await
//! }
//! ```

pub mod backoff;
pub mod bootstrap;
pub mod client;
pub mod config;
pub mod context;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod registry;
pub mod supervisor;
pub mod transport;

// Re-export commonly used types
pub use backoff::BackoffConfig;
pub use bootstrap::LoadedJob;
pub use client::{Client, ControllerHandle};
pub use config::{
    AccountConfig, ClientOptions, Endpoint, HomeConfig, Identity, JobCredentials,
    ProjectSelector, SessionConfig, UserSelection,
};
pub use context::JobContext;
pub use error::{ClientError, Result};
pub use registry::{ActionDescriptor, ActionFailure, ActionTable, Controller};
pub use supervisor::{ConnectionState, JobOutcome};
