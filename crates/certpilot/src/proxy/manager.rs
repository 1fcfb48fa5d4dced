//! Command-driven proxy manager
//!
//! Drives any proxy that can be controlled from the command line. Two
//! process models are supported:
//!
//! - daemonizing proxies (`nginx`, `systemctl start ...`): start/stop/reload
//!   are plain commands and liveness is a TCP connect or `status-command`
//! - foreground proxies (`foreground true`): the start command is spawned
//!   and supervised, stopped with SIGTERM then SIGKILL after the grace
//!   period, and reloaded with SIGHUP

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use certpilot_common::{PollPolicy, ProxyConfigVariant};
use certpilot_config::{Config, ProxyConfig};

use super::template::{TemplateContext, TemplateSet};
use super::{ProxyConfigManager, ProxyError};

/// Placeholder in commands replaced by a config file path
pub const CONFIG_PLACEHOLDER: &str = "{config}";

const READINESS_INTERVAL: Duration = Duration::from_millis(250);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

pub struct CommandProxyManager {
    settings: ProxyConfig,
    templates: TemplateSet,
    context: TemplateContext,
    http_address: SocketAddr,
    /// Supervised proxy process in foreground mode
    child: Mutex<Option<Child>>,
}

impl CommandProxyManager {
    pub fn new(settings: ProxyConfig, templates: TemplateSet, context: TemplateContext) -> Result<Self, ProxyError> {
        let http_address = settings.http_address.parse().map_err(|e| {
            ProxyError::Start(format!("invalid http-address '{}': {}", settings.http_address, e))
        })?;

        Ok(Self {
            settings,
            templates,
            context,
            http_address,
            child: Mutex::new(None),
        })
    }

    /// Build from configuration, pointing the TLS variant at the live bundle paths
    pub fn from_config(config: &Config, cert_path: PathBuf, key_path: PathBuf) -> Result<Self, ProxyError> {
        let templates = TemplateSet::load(
            config.proxy.http_only_template.as_deref(),
            config.proxy.tls_template.as_deref(),
        )?;
        let context = TemplateContext::new(config, cert_path, key_path);
        Self::new(config.proxy.clone(), templates, context)
    }

    pub fn config_path(&self) -> &Path {
        &self.settings.config_path
    }

    /// Where a variant is rendered before activation
    pub fn staged_path(&self) -> PathBuf {
        let name = self
            .settings
            .config_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "proxy.conf".to_string());
        self.settings
            .config_path
            .with_file_name(format!(".{}.certpilot-staged", name))
    }

    fn readiness_policy(&self) -> PollPolicy {
        PollPolicy::new(READINESS_INTERVAL, self.settings.command_timeout())
    }

    /// Run a control command to completion, returning its stdout
    async fn run(&self, argv: &[String], config: &Path) -> Result<String, ProxyError> {
        let argv = expand(argv, config);
        let command_line = argv.join(" ");
        let (program, args) = argv.split_first().ok_or_else(|| ProxyError::Command {
            command: command_line.clone(),
            message: "empty command".to_string(),
        })?;

        debug!(command = %command_line, "Running proxy command");

        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);

        let limit = self.settings.command_timeout();
        let output = match timeout(limit, cmd.output()).await {
            Err(_) => {
                return Err(ProxyError::Timeout {
                    command: command_line,
                    elapsed: limit,
                })
            }
            Ok(Err(e)) => {
                return Err(ProxyError::Command {
                    command: command_line,
                    message: format!("failed to spawn: {}", e),
                })
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = match stderr.trim() {
                "" => format!("exited with {}", output.status),
                text => {
                    let lines: Vec<&str> = text.lines().collect();
                    lines[lines.len().saturating_sub(5)..].join("; ")
                }
            };
            return Err(ProxyError::Command {
                command: command_line,
                message,
            });
        }

        trace!(command = %command_line, "Proxy command succeeded");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Syntax check of rendered content
    ///
    /// With a `{config}` placeholder the staged file is checked directly.
    /// Otherwise the content is swapped into the active path for the check
    /// and the previous file restored afterwards.
    async fn syntax_check(&self, rendered: &str, staged: &Path) -> Result<(), ProxyError> {
        let command = &self.settings.test_command;
        if command.iter().any(|arg| arg.contains(CONFIG_PLACEHOLDER)) {
            return self.run(command, staged).await.map(|_| ());
        }

        let active = &self.settings.config_path;
        let previous = match fs::read(active) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(ProxyError::io(active, e)),
        };

        write_file(active, rendered.as_bytes())?;
        let result = self.run(command, active).await.map(|_| ());

        let restored = match previous {
            Some(bytes) => write_file(active, &bytes),
            None => fs::remove_file(active).map_err(|e| ProxyError::io(active, e)),
        };
        result.and(restored)
    }

    async fn listening(&self) -> bool {
        matches!(
            timeout(CONNECT_TIMEOUT, TcpStream::connect(self.http_address)).await,
            Ok(Ok(_))
        )
    }

    async fn check_running(&self) -> bool {
        if !self.settings.status_command.is_empty() {
            return self
                .run(&self.settings.status_command, &self.settings.config_path)
                .await
                .is_ok();
        }

        {
            let mut guard = self.child.lock().await;
            if let Some(child) = guard.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    warn!(status = %status, "Supervised proxy exited");
                    *guard = None;
                    return false;
                }
            }
        }

        self.listening().await
    }

    async fn wait_ready(&self) -> Result<(), ProxyError> {
        let outcome = self
            .readiness_policy()
            .poll(|_| async move {
                if self.check_running().await {
                    Ok(())
                } else {
                    Err(())
                }
            })
            .await;

        if outcome.is_ready() {
            return Ok(());
        }

        let exited = self.settings.foreground && self.child.lock().await.is_none();
        Err(ProxyError::Start(if exited {
            "proxy process exited during startup".to_string()
        } else {
            format!(
                "proxy not listening on {} after {}s",
                self.http_address,
                self.settings.command_timeout_secs
            )
        }))
    }

    async fn spawn_supervised(&self) -> Result<Option<u32>, ProxyError> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                debug!(pid = ?child.id(), "Supervised proxy already running");
                return Ok(child.id());
            }
        }

        let argv = expand(&self.settings.start_command, &self.settings.config_path);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProxyError::Start("start-command is empty".to_string()))?;

        info!(command = %program, "Starting supervised proxy");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProxyError::Start(format!("failed to spawn '{}': {}", program, e)))?;

        let pid = child.id();
        *guard = Some(child);
        Ok(pid)
    }
}

#[async_trait]
impl ProxyConfigManager for CommandProxyManager {
    async fn verify_config(&self, variant: ProxyConfigVariant) -> Result<(), ProxyError> {
        let rendered = self.templates.render(variant, &self.context)?;
        let staged = self.staged_path();
        write_file(&staged, rendered.as_bytes())?;

        if self.settings.test_command.is_empty() {
            debug!(variant = %variant, "No test-command configured, skipping syntax check");
            return Ok(());
        }

        self.syntax_check(&rendered, &staged)
            .await
            .map_err(|e| match e {
                ProxyError::Io { .. } => e,
                other => ProxyError::Config {
                    variant,
                    message: other.to_string(),
                },
            })?;

        debug!(variant = %variant, "Proxy configuration verified");
        Ok(())
    }

    async fn select_variant(&self, variant: ProxyConfigVariant) -> Result<(), ProxyError> {
        self.verify_config(variant).await?;

        let staged = self.staged_path();
        fs::rename(&staged, &self.settings.config_path)
            .map_err(|e| ProxyError::io(&self.settings.config_path, e))?;

        info!(
            variant = %variant,
            path = %self.settings.config_path.display(),
            "Activated proxy configuration"
        );
        Ok(())
    }

    async fn start(&self) -> Result<Option<u32>, ProxyError> {
        let pid = if self.settings.foreground {
            self.spawn_supervised().await?
        } else {
            self.run(&self.settings.start_command, &self.settings.config_path)
                .await
                .map_err(|e| ProxyError::Start(e.to_string()))?;
            None
        };

        self.wait_ready().await?;
        info!(pid = ?pid, address = %self.http_address, "Proxy is up");
        Ok(pid)
    }

    async fn stop(&self) -> Result<(), ProxyError> {
        let child = self.child.lock().await.take();

        if let Some(mut child) = child {
            info!(pid = ?child.id(), "Stopping supervised proxy");

            if let Some(pid) = child.id() {
                if let Err(e) = send_signal(pid, Signal::SIGTERM) {
                    debug!(error = %e, "SIGTERM not delivered");
                }
            }

            tokio::select! {
                _ = sleep(self.settings.stop_grace()) => {
                    warn!("Proxy didn't stop gracefully, killing");
                    let _ = child.kill().await;
                }
                result = child.wait() => {
                    debug!(?result, "Proxy stopped");
                }
            }
            return Ok(());
        }

        if !self.check_running().await {
            debug!("Proxy already stopped");
            return Ok(());
        }

        if self.settings.stop_command.is_empty() {
            return Err(ProxyError::Command {
                command: "stop".to_string(),
                message: "no stop-command configured and no supervised process".to_string(),
            });
        }

        info!("Stopping proxy");
        self.run(&self.settings.stop_command, &self.settings.config_path)
            .await?;

        let outcome = PollPolicy::new(READINESS_INTERVAL, self.settings.stop_grace())
            .poll(|_| async move {
                if self.check_running().await {
                    Err(())
                } else {
                    Ok(())
                }
            })
            .await;

        if !outcome.is_ready() {
            return Err(ProxyError::Timeout {
                command: self.settings.stop_command.join(" "),
                elapsed: self.settings.stop_grace(),
            });
        }
        Ok(())
    }

    async fn reload(&self) -> Result<(), ProxyError> {
        if !self.settings.reload_command.is_empty() {
            self.run(&self.settings.reload_command, &self.settings.config_path)
                .await?;
            info!("Proxy reloaded");
            return Ok(());
        }

        let pid = self.child.lock().await.as_ref().and_then(|c| c.id());
        match pid {
            Some(pid) => {
                send_signal(pid, Signal::SIGHUP)?;
                info!(pid, "Sent SIGHUP to proxy");
                Ok(())
            }
            None => Err(ProxyError::NotRunning),
        }
    }

    async fn restart(&self) -> Result<Option<u32>, ProxyError> {
        if !self.settings.restart_command.is_empty() {
            self.run(&self.settings.restart_command, &self.settings.config_path)
                .await?;
            self.wait_ready().await?;
            info!("Proxy restarted");
            return Ok(None);
        }

        self.stop().await?;
        self.start().await
    }

    async fn is_running(&self) -> bool {
        self.check_running().await
    }

    async fn port_released(&self, addr: SocketAddr) -> bool {
        TcpListener::bind(addr).await.is_ok()
    }
}

impl std::fmt::Debug for CommandProxyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProxyManager")
            .field("config_path", &self.settings.config_path)
            .field("foreground", &self.settings.foreground)
            .field("http_address", &self.http_address)
            .finish()
    }
}

fn expand(argv: &[String], config: &Path) -> Vec<String> {
    let path = config.display().to_string();
    argv.iter()
        .map(|arg| arg.replace(CONFIG_PLACEHOLDER, &path))
        .collect()
}

fn write_file(path: &Path, content: &[u8]) -> Result<(), ProxyError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ProxyError::io(parent, e))?;
    }
    fs::write(path, content).map_err(|e| ProxyError::io(path, e))
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), ProxyError> {
    let raw = i32::try_from(pid).map_err(|_| ProxyError::NotRunning)?;
    kill(Pid::from_raw(raw), signal).map_err(|e| ProxyError::Command {
        command: format!("kill -{:?} {}", signal, pid),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &Path) -> ProxyConfig {
        ProxyConfig {
            config_path: dir.join("conf.d/site.conf"),
            start_command: vec!["true".to_string()],
            http_address: "127.0.0.1:9".to_string(),
            command_timeout_secs: 1,
            stop_grace_secs: 2,
            ..ProxyConfig::default()
        }
    }

    fn context(dir: &Path) -> TemplateContext {
        TemplateContext {
            domain: "example.test".to_string(),
            webroot: dir.join("webroot"),
            cert_path: dir.join("cert.pem"),
            key_path: dir.join("key.pem"),
            backend: "http://127.0.0.1:8000".to_string(),
            http_port: 80,
            https_port: 443,
        }
    }

    fn manager(settings: ProxyConfig, dir: &Path) -> CommandProxyManager {
        CommandProxyManager::new(settings, TemplateSet::default(), context(dir)).unwrap()
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_verify_checks_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.test_command = sh("grep -q ssl_certificate {config}");
        let manager = manager(settings, dir.path());

        assert!(manager.verify_config(ProxyConfigVariant::TlsRedirect).await.is_ok());

        let err = manager
            .verify_config(ProxyConfigVariant::HttpOnly)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Config { variant: ProxyConfigVariant::HttpOnly, .. }
        ));
        assert!(!manager.config_path().exists());
    }

    #[tokio::test]
    async fn test_failed_select_keeps_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.test_command = vec!["false".to_string()];
        let manager = manager(settings, dir.path());

        write_file(manager.config_path(), b"previous").unwrap();

        let result = manager.select_variant(ProxyConfigVariant::TlsRedirect).await;
        assert!(matches!(result, Err(ProxyError::Config { .. })));
        assert_eq!(fs::read_to_string(manager.config_path()).unwrap(), "previous");
    }

    #[tokio::test]
    async fn test_select_activates_after_in_place_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        let active = settings.config_path.display().to_string();
        // Checks the active path, which must hold the candidate during the test
        settings.test_command = sh(&format!("grep -q 'tls-redirect' {}", active));
        let manager = manager(settings, dir.path());

        write_file(manager.config_path(), b"previous").unwrap();

        manager
            .select_variant(ProxyConfigVariant::TlsRedirect)
            .await
            .unwrap();

        let content = fs::read_to_string(manager.config_path()).unwrap();
        assert!(content.contains("ssl_certificate"));
        assert!(!manager.staged_path().exists());
    }

    #[tokio::test]
    async fn test_supervised_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let mut settings = settings(dir.path());
        settings.foreground = true;
        settings.start_command = vec!["sleep".to_string(), "30".to_string()];
        settings.http_address = listener.local_addr().unwrap().to_string();
        let manager = manager(settings, dir.path());

        let pid = manager.start().await.unwrap().expect("supervised pid");
        assert!(manager.is_running().await);

        manager.stop().await.unwrap();
        let raw = Pid::from_raw(i32::try_from(pid).unwrap());
        assert!(kill(raw, None).is_err(), "process should be gone");
    }

    #[tokio::test]
    async fn test_start_fails_when_nothing_listens() {
        let dir = tempfile::tempdir().unwrap();
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let mut settings = settings(dir.path());
        settings.http_address = addr.to_string();
        let manager = manager(settings, dir.path());

        assert!(matches!(manager.start().await, Err(ProxyError::Start(_))));
    }

    #[tokio::test]
    async fn test_reload_without_command_or_process() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(settings(dir.path()), dir.path());
        assert!(matches!(manager.reload().await, Err(ProxyError::NotRunning)));

        let mut settings = settings(dir.path());
        settings.reload_command = vec!["true".to_string()];
        let manager = CommandProxyManager::new(settings, TemplateSet::default(), context(dir.path())).unwrap();
        assert!(manager.reload().await.is_ok());
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.reload_command = vec!["sleep".to_string(), "5".to_string()];
        let manager = manager(settings, dir.path());

        assert!(matches!(manager.reload().await, Err(ProxyError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_failed_command_reports_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.reload_command = vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()];
        let manager = manager(settings, dir.path());

        match manager.reload().await {
            Err(ProxyError::Command { command, message }) => {
                assert_eq!(command, "sh -c exit 3");
                assert!(message.contains("exit"), "{}", message);
            }
            other => panic!("expected a command failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_port_released() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(settings(dir.path()), dir.path());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(!manager.port_released(addr).await);

        drop(listener);
        assert!(manager.port_released(addr).await);
    }

    #[test]
    fn test_expand_placeholder() {
        let argv = vec!["nginx".to_string(), "-t".to_string(), "-c".to_string(), "{config}".to_string()];
        assert_eq!(
            expand(&argv, Path::new("/etc/nginx/site.conf")),
            vec!["nginx", "-t", "-c", "/etc/nginx/site.conf"]
        );
    }
}
