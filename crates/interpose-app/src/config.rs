//! Application settings.

use std::path::PathBuf;
use std::time::Duration;

use interpose_core::DEFAULT_BASE_PORT;
use interpose_server::DEFAULT_PORT;

/// An editor to launch behind the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorConfig {
    /// Executable to run.
    pub program: PathBuf,
    /// Extra arguments appended after the proxy flag.
    pub args: Vec<String>,
}

impl EditorConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// Everything the application needs to start.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// First port tried for the default session.
    pub proxy_port: u16,
    /// Port of the control API.
    pub control_port: u16,
    /// Start with intercept-hold enabled.
    pub intercept: bool,
    /// How long a held request waits before it is forwarded.
    pub hold_timeout: Option<Duration>,
    /// Where the root CA lives. Defaults to the platform data directory.
    pub ca_dir: Option<PathBuf>,
    /// Editor launched once the default session is listening.
    pub editor: Option<EditorConfig>,
    /// Point the OS proxy at the default session.
    pub set_system_proxy: bool,
    /// Print every captured event to stdout as a JSON line.
    pub print_events: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            proxy_port: DEFAULT_BASE_PORT,
            control_port: DEFAULT_PORT,
            intercept: false,
            hold_timeout: None,
            ca_dir: None,
            editor: None,
            set_system_proxy: false,
            print_events: false,
        }
    }
}

impl AppConfig {
    pub fn with_proxy_port(mut self, port: u16) -> Self {
        self.proxy_port = port;
        self
    }

    pub fn with_control_port(mut self, port: u16) -> Self {
        self.control_port = port;
        self
    }

    pub fn with_intercept(mut self, enabled: bool) -> Self {
        self.intercept = enabled;
        self
    }

    pub fn with_hold_timeout(mut self, timeout: Duration) -> Self {
        self.hold_timeout = Some(timeout);
        self
    }

    pub fn with_ca_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ca_dir = Some(dir.into());
        self
    }

    pub fn with_editor(mut self, editor: EditorConfig) -> Self {
        self.editor = Some(editor);
        self
    }

    pub fn with_system_proxy(mut self, enabled: bool) -> Self {
        self.set_system_proxy = enabled;
        self
    }

    pub fn with_print_events(mut self, enabled: bool) -> Self {
        self.print_events = enabled;
        self
    }
}
