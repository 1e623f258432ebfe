//! Start/stop control for the default session.

use std::sync::Arc;

use interpose_proxy::{SessionRegistry, DEFAULT_SESSION_ID};

use crate::error::Result;
use crate::launcher::EditorLauncher;

/// Drives the single `"default"` session and the editor attached to it.
#[derive(Debug)]
pub struct Controller {
    registry: Arc<SessionRegistry>,
    launcher: Option<EditorLauncher>,
    intercept: bool,
}

impl Controller {
    pub fn new(
        registry: Arc<SessionRegistry>,
        launcher: Option<EditorLauncher>,
        intercept: bool,
    ) -> Self {
        Self {
            registry,
            launcher,
            intercept,
        }
    }

    /// Starts the default session at or above `port` and launches the editor.
    ///
    /// Calling it again while the session runs returns the same port and does
    /// not launch a second editor.
    pub fn start(&self, port: u16) -> Result<u16> {
        if let Some(port) = self.registry.session_port(DEFAULT_SESSION_ID) {
            return Ok(port);
        }

        let port = self.registry.create_session_from(DEFAULT_SESSION_ID, port)?;
        if self.intercept {
            self.registry.set_intercept(DEFAULT_SESSION_ID, true);
        }

        if let Some(launcher) = &self.launcher {
            if let Err(e) = launcher.launch(port) {
                self.registry.stop_session(DEFAULT_SESSION_ID);
                return Err(e);
            }
        }
        Ok(port)
    }

    /// Stops the default session and any editor launched for it.
    pub fn stop(&self) {
        if let Some(launcher) = &self.launcher {
            launcher.terminate();
        }
        self.registry.stop_session(DEFAULT_SESSION_ID);
    }

    pub fn port(&self) -> Option<u16> {
        self.registry.session_port(DEFAULT_SESSION_ID)
    }

    pub fn is_running(&self) -> bool {
        self.port().is_some()
    }
}
