//! Operating-system proxy settings.
//!
//! Points the desktop's HTTP/HTTPS proxy at a running session so that
//! applications which honour system settings route through it:
//! - Linux: GNOME `gsettings`
//! - macOS: `networksetup` on the active network service
//! - Windows: Internet Settings registry keys via PowerShell

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How long [`test`] waits for the proxy to accept a connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Where the system proxy should point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemProxyConfig {
    pub host: String,
    pub port: u16,
    /// Hosts that bypass the proxy.
    #[serde(default = "default_bypass")]
    pub bypass: Vec<String>,
}

fn default_bypass() -> Vec<String> {
    vec!["localhost".to_string(), "127.0.0.1".to_string()]
}

impl SystemProxyConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            bypass: default_bypass(),
        }
    }

    pub fn with_bypass(mut self, bypass: Vec<String>) -> Self {
        self.bypass = bypass;
        self
    }

    /// Returns the proxy URL.
    pub fn proxy_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    fn server(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Result of a system proxy operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupResult {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Human-readable message.
    pub message: String,
    /// Whether admin/root privileges are required.
    pub needs_admin: bool,
}

impl SetupResult {
    pub(crate) fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            needs_admin: false,
        }
    }

    pub(crate) fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            needs_admin: false,
        }
    }

    #[allow(dead_code)]
    pub(crate) fn needs_admin(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            needs_admin: true,
        }
    }
}

/// Checks that something is accepting connections at the configured address.
pub fn test(config: &SystemProxyConfig) -> SetupResult {
    let addrs: Vec<SocketAddr> = match (config.host.as_str(), config.port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(e) => return SetupResult::failure(format!("Cannot resolve {}: {}", config.host, e)),
    };

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(_) => {
                return SetupResult::success(format!("Proxy reachable at {}", config.proxy_url()))
            }
            Err(e) => last_error = Some(e),
        }
    }

    match last_error {
        Some(e) => SetupResult::failure(format!(
            "Proxy not reachable at {}: {}",
            config.proxy_url(),
            e
        )),
        None => SetupResult::failure(format!("No address found for {}", config.host)),
    }
}

/// Points the system proxy at `config`.
pub fn set(config: &SystemProxyConfig) -> SetupResult {
    tracing::info!(url = %config.proxy_url(), "Enabling system proxy");

    #[cfg(target_os = "windows")]
    {
        set_windows(config)
    }

    #[cfg(target_os = "macos")]
    {
        set_macos(config)
    }

    #[cfg(target_os = "linux")]
    {
        set_linux(config)
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        let _ = config;
        SetupResult::failure("Unsupported operating system")
    }
}

/// Turns the system proxy off.
pub fn clear() -> SetupResult {
    tracing::info!("Disabling system proxy");

    #[cfg(target_os = "windows")]
    {
        clear_windows()
    }

    #[cfg(target_os = "macos")]
    {
        clear_macos()
    }

    #[cfg(target_os = "linux")]
    {
        clear_linux()
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        SetupResult::failure("Unsupported operating system")
    }
}

/// Checks whether the system proxy currently points at `config`.
pub fn is_enabled(config: &SystemProxyConfig) -> bool {
    #[cfg(target_os = "windows")]
    {
        is_enabled_windows(config)
    }

    #[cfg(target_os = "macos")]
    {
        is_enabled_macos(config)
    }

    #[cfg(target_os = "linux")]
    {
        is_enabled_linux(config)
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        let _ = config;
        false
    }
}

fn run(program: &str, args: &[&str]) -> std::io::Result<std::process::Output> {
    let mut command = Command::new(program);
    command.args(args);

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    command.output()
}

// ============================================================================
// Windows
// ============================================================================

#[cfg(target_os = "windows")]
fn powershell(script: &str) -> std::io::Result<std::process::Output> {
    run(
        "powershell",
        &["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", script],
    )
}

#[cfg(target_os = "windows")]
fn set_windows(config: &SystemProxyConfig) -> SetupResult {
    let mut overrides = config.bypass.clone();
    overrides.push("<local>".to_string());

    let script = format!(
        r#"
        $regPath = 'HKCU:\Software\Microsoft\Windows\CurrentVersion\Internet Settings'
        Set-ItemProperty -Path $regPath -Name ProxyEnable -Value 1
        Set-ItemProperty -Path $regPath -Name ProxyServer -Value '{}'
        Set-ItemProperty -Path $regPath -Name ProxyOverride -Value '{}'
        "#,
        config.server(),
        overrides.join(";")
    );

    match powershell(&script) {
        Ok(out) if out.status.success() => {
            SetupResult::success(format!("System proxy enabled: {}", config.server()))
        }
        Ok(out) => SetupResult::failure(format!(
            "Failed to enable proxy: {}",
            String::from_utf8_lossy(&out.stderr)
        )),
        Err(e) => SetupResult::failure(format!("Failed to run PowerShell: {}", e)),
    }
}

#[cfg(target_os = "windows")]
fn clear_windows() -> SetupResult {
    let script = r#"
        $regPath = 'HKCU:\Software\Microsoft\Windows\CurrentVersion\Internet Settings'
        Set-ItemProperty -Path $regPath -Name ProxyEnable -Value 0
    "#;

    match powershell(script) {
        Ok(out) if out.status.success() => SetupResult::success("System proxy disabled"),
        Ok(out) => SetupResult::failure(format!(
            "Failed to disable proxy: {}",
            String::from_utf8_lossy(&out.stderr)
        )),
        Err(e) => SetupResult::failure(format!("Failed to run PowerShell: {}", e)),
    }
}

#[cfg(target_os = "windows")]
fn is_enabled_windows(config: &SystemProxyConfig) -> bool {
    let script = r#"
        $regPath = 'HKCU:\Software\Microsoft\Windows\CurrentVersion\Internet Settings'
        $enabled = (Get-ItemProperty -Path $regPath -Name ProxyEnable -ErrorAction SilentlyContinue).ProxyEnable
        $server = (Get-ItemProperty -Path $regPath -Name ProxyServer -ErrorAction SilentlyContinue).ProxyServer
        Write-Output "$enabled|$server"
    "#;

    match powershell(script) {
        Ok(out) => {
            let stdout = String::from_utf8_lossy(&out.stdout);
            stdout.contains("1|") && stdout.contains(&config.server())
        }
        Err(_) => false,
    }
}

// ============================================================================
// macOS
// ============================================================================

#[cfg(target_os = "macos")]
fn active_network_service() -> Option<String> {
    let output = run("networksetup", &["-listallnetworkservices"]).ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    for service in ["Wi-Fi", "Ethernet", "USB 10/100/1000 LAN"] {
        if stdout.contains(service) {
            return Some(service.to_string());
        }
    }

    // First enabled service; disabled ones are prefixed with '*'.
    stdout
        .lines()
        .skip(1)
        .find(|line| !line.starts_with('*'))
        .map(|s| s.to_string())
}

#[cfg(target_os = "macos")]
fn set_macos(config: &SystemProxyConfig) -> SetupResult {
    let Some(service) = active_network_service() else {
        return SetupResult::failure("Could not find active network service");
    };
    let port = config.port.to_string();

    let http = run(
        "networksetup",
        &["-setwebproxy", &service, &config.host, &port],
    );
    let https = run(
        "networksetup",
        &["-setsecurewebproxy", &service, &config.host, &port],
    );
    let _ = run("networksetup", &["-setwebproxystate", &service, "on"]);
    let _ = run("networksetup", &["-setsecurewebproxystate", &service, "on"]);

    if !config.bypass.is_empty() {
        let mut args = vec!["-setproxybypassdomains", service.as_str()];
        args.extend(config.bypass.iter().map(String::as_str));
        let _ = run("networksetup", &args);
    }

    match (http, https) {
        (Ok(h), Ok(s)) if h.status.success() && s.status.success() => SetupResult::success(
            format!("System proxy enabled on {} ({})", service, config.server()),
        ),
        _ => SetupResult::needs_admin("Failed to set proxy. May need administrator privileges."),
    }
}

#[cfg(target_os = "macos")]
fn clear_macos() -> SetupResult {
    let Some(service) = active_network_service() else {
        return SetupResult::failure("Could not find active network service");
    };

    let _ = run("networksetup", &["-setwebproxystate", &service, "off"]);
    let _ = run("networksetup", &["-setsecurewebproxystate", &service, "off"]);

    SetupResult::success("System proxy disabled")
}

#[cfg(target_os = "macos")]
fn is_enabled_macos(config: &SystemProxyConfig) -> bool {
    let Some(service) = active_network_service() else {
        return false;
    };

    match run("networksetup", &["-getwebproxy", &service]) {
        Ok(out) => {
            let stdout = String::from_utf8_lossy(&out.stdout);
            stdout.contains("Enabled: Yes")
                && stdout.contains(&format!("Server: {}", config.host))
                && stdout.contains(&format!("Port: {}", config.port))
        }
        Err(_) => false,
    }
}

// ============================================================================
// Linux
// ============================================================================

#[cfg(target_os = "linux")]
fn gsettings_bypass(bypass: &[String]) -> String {
    let quoted: Vec<String> = bypass.iter().map(|h| format!("'{}'", h)).collect();
    format!("[{}]", quoted.join(", "))
}

#[cfg(target_os = "linux")]
fn set_linux(config: &SystemProxyConfig) -> SetupResult {
    let mode = run(
        "gsettings",
        &["set", "org.gnome.system.proxy", "mode", "manual"],
    );

    match mode {
        Ok(out) if out.status.success() => {
            let port = config.port.to_string();
            for schema in ["org.gnome.system.proxy.http", "org.gnome.system.proxy.https"] {
                let _ = run("gsettings", &["set", schema, "host", &config.host]);
                let _ = run("gsettings", &["set", schema, "port", &port]);
            }
            let _ = run(
                "gsettings",
                &[
                    "set",
                    "org.gnome.system.proxy",
                    "ignore-hosts",
                    &gsettings_bypass(&config.bypass),
                ],
            );
            SetupResult::success(format!("GNOME proxy configured: {}", config.proxy_url()))
        }
        _ => {
            let url = config.proxy_url();
            SetupResult::failure(format!(
                "gsettings unavailable. Set the proxy in your environment instead:\nexport http_proxy={url}\nexport https_proxy={url}"
            ))
        }
    }
}

#[cfg(target_os = "linux")]
fn clear_linux() -> SetupResult {
    match run("gsettings", &["set", "org.gnome.system.proxy", "mode", "none"]) {
        Ok(out) if out.status.success() => SetupResult::success("GNOME proxy disabled"),
        Ok(out) => SetupResult::failure(format!(
            "Failed to disable proxy: {}",
            String::from_utf8_lossy(&out.stderr)
        )),
        Err(e) => SetupResult::failure(format!("Failed to run gsettings: {}", e)),
    }
}

#[cfg(target_os = "linux")]
fn is_enabled_linux(config: &SystemProxyConfig) -> bool {
    if let Ok(out) = run("gsettings", &["get", "org.gnome.system.proxy", "mode"]) {
        if String::from_utf8_lossy(&out.stdout).contains("manual") {
            let host = run("gsettings", &["get", "org.gnome.system.proxy.http", "host"]);
            let port = run("gsettings", &["get", "org.gnome.system.proxy.http", "port"]);
            if let (Ok(h), Ok(p)) = (host, port) {
                return String::from_utf8_lossy(&h.stdout).contains(&config.host)
                    && String::from_utf8_lossy(&p.stdout).trim() == config.port.to_string();
            }
        }
    }

    std::env::var("http_proxy")
        .or_else(|_| std::env::var("HTTP_PROXY"))
        .map(|v| v.contains(&config.server()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn config_defaults() {
        let config = SystemProxyConfig::new("127.0.0.1", 8081);
        assert_eq!(config.proxy_url(), "http://127.0.0.1:8081");
        assert_eq!(config.bypass, vec!["localhost", "127.0.0.1"]);

        let config = config.with_bypass(vec!["*.internal".into()]);
        assert_eq!(config.bypass, vec!["*.internal"]);
    }

    #[test]
    fn config_json_bypass_is_optional() {
        let config: SystemProxyConfig =
            serde_json::from_str(r#"{"host":"127.0.0.1","port":9000}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.bypass, default_bypass());
    }

    #[test]
    fn setup_result_constructors() {
        assert!(SetupResult::success("ok").success);
        let failure = SetupResult::failure("no");
        assert!(!failure.success && !failure.needs_admin);
        let admin = SetupResult::needs_admin("sudo");
        assert!(!admin.success && admin.needs_admin);
    }

    #[test]
    fn test_reports_listening_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = test(&SystemProxyConfig::new("127.0.0.1", port));
        assert!(result.success, "{}", result.message);
    }

    #[test]
    fn test_reports_closed_port() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = test(&SystemProxyConfig::new("127.0.0.1", port));
        assert!(!result.success);
        assert!(result.message.contains("not reachable"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn gsettings_list_syntax() {
        assert_eq!(
            gsettings_bypass(&["localhost".into(), "10.0.0.0/8".into()]),
            "['localhost', '10.0.0.0/8']"
        );
        assert_eq!(gsettings_bypass(&[]), "[]");
    }
}
