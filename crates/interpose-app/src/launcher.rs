//! Launching an editor behind the proxy.
//!
//! The editor is started with `--proxy-server=http://127.0.0.1:<port>`. That
//! flag is also how [`EditorLauncher::terminate`] recognises editor processes,
//! so instances left over from an earlier run are cleaned up too.

use std::ffi::OsStr;
use std::process::{Child, Command, Stdio};

use parking_lot::Mutex;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

use crate::config::EditorConfig;
use crate::error::{AppError, Result};

/// Command-line flag that routes the editor through the proxy.
pub fn proxy_flag(port: u16) -> String {
    format!("--proxy-server=http://127.0.0.1:{}", port)
}

/// Spawns and terminates editor processes.
#[derive(Debug)]
pub struct EditorLauncher {
    editor: EditorConfig,
    children: Mutex<Vec<Child>>,
    port: Mutex<Option<u16>>,
}

impl EditorLauncher {
    pub fn new(editor: EditorConfig) -> Self {
        Self {
            editor,
            children: Mutex::new(Vec::new()),
            port: Mutex::new(None),
        }
    }

    pub fn editor(&self) -> &EditorConfig {
        &self.editor
    }

    /// Starts the editor pointed at `port`. Returns its process id.
    pub fn launch(&self, port: u16) -> Result<u32> {
        let child = Command::new(&self.editor.program)
            .arg(proxy_flag(port))
            .args(&self.editor.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| AppError::Launch {
                program: self.editor.program.display().to_string(),
                source,
            })?;

        let pid = child.id();
        tracing::info!(pid, port, program = %self.editor.program.display(), "Editor launched");
        self.children.lock().push(child);
        *self.port.lock() = Some(port);
        Ok(pid)
    }

    /// Kills every process carrying the proxy flag for the last launched port.
    ///
    /// Returns how many processes were signalled.
    pub fn terminate(&self) -> usize {
        let Some(port) = self.port.lock().take() else {
            return 0;
        };
        let flag = proxy_flag(port);

        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );

        let mut killed = 0;
        for (pid, process) in system.processes() {
            if has_arg(process.cmd(), &flag) && process.kill() {
                tracing::debug!(pid = pid.as_u32(), "Killed editor process");
                killed += 1;
            }
        }

        // Reap our own children so they do not linger as zombies.
        for mut child in self.children.lock().drain(..) {
            let _ = child.kill();
            let _ = child.wait();
        }

        if killed > 0 {
            tracing::info!(count = killed, "Editor processes terminated");
        }
        killed
    }
}

impl Drop for EditorLauncher {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn has_arg<S: AsRef<OsStr>>(cmd: &[S], flag: &str) -> bool {
    cmd.iter().any(|arg| arg.as_ref() == OsStr::new(flag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_format() {
        assert_eq!(proxy_flag(8081), "--proxy-server=http://127.0.0.1:8081");
    }

    #[test]
    fn has_arg_matches_whole_argument() {
        let cmd = ["code", "--proxy-server=http://127.0.0.1:8081", "--wait"];
        assert!(has_arg(&cmd, &proxy_flag(8081)));
        assert!(!has_arg(&cmd, &proxy_flag(808)));
    }

    #[test]
    fn terminate_without_launch_is_noop() {
        let launcher = EditorLauncher::new(EditorConfig::new("does-not-matter"));
        assert_eq!(launcher.terminate(), 0);
    }

    #[test]
    fn missing_program_is_a_launch_error() {
        let launcher = EditorLauncher::new(EditorConfig::new("/nonexistent/interpose-editor"));
        match launcher.launch(8081) {
            Err(AppError::Launch { program, .. }) => {
                assert_eq!(program, "/nonexistent/interpose-editor")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn launched_editor_is_terminated() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("editor.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        // An unlikely port keeps other processes out of the match.
        let port = 47913;
        let launcher = EditorLauncher::new(EditorConfig::new(&script));
        let pid = launcher.launch(port).unwrap();
        assert!(pid > 0);

        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(launcher.terminate() >= 1);
        assert_eq!(launcher.terminate(), 0);
    }
}
