//! Interpose - capture and inspect HTTP(S) traffic from a launched editor.
//!
//! This crate wires the proxy engine into a runnable application:
//!
//! - [`config`] holds the settings the binary collects from the command line
//! - [`context`] owns the event sink, the session registry and the default controller
//! - [`controller`] starts and stops the `"default"` session
//! - [`launcher`] spawns an editor pointed at the proxy and terminates it again
//!
//! # Usage
//!
//! ```no_run
//! use interpose_app::{AppConfig, AppContext};
//!
//! # async fn run() -> Result<(), interpose_app::AppError> {
//! let ctx = AppContext::init(AppConfig::default())?;
//! let port = ctx.controller().start(8081)?;
//! println!("proxy on {}", port);
//! ctx.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod launcher;

pub use config::{AppConfig, EditorConfig};
pub use context::AppContext;
pub use controller::Controller;
pub use error::{AppError, Result};
pub use launcher::EditorLauncher;
