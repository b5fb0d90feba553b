use crate::error::AppManagerError;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ManagerConfig {
    pub server: ServerConfig,
    pub monitor: MonitorConfig,
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub applications: Vec<ApplicationConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Directory searched first for relative application locations
    #[serde(default = "default_apps_dir")]
    pub apps_dir: PathBuf,

    /// Directory searched second for relative application locations
    #[serde(default = "default_shared_apps_dir")]
    pub shared_apps_dir: PathBuf,

    /// Root holding the cache/, cacheAdapt/ and cacheOverlay/ trees
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MonitorConfig {
    /// Watch for applications that are not present yet
    #[serde(default = "default_monitor_enabled")]
    pub enabled: bool,

    /// How change notifications are delivered
    #[serde(default = "default_monitor_trigger")]
    pub trigger: MonitorTrigger,

    /// Polling interval in milliseconds
    #[serde(default = "default_monitor_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MonitorTrigger {
    Polled,
    External,
    Disabled,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LifecycleConfig {
    /// Seconds before a still-running install is reported as slow
    #[serde(default = "default_slow_start_timeout")]
    pub slow_start_timeout_seconds: u64,

    /// Seconds a restart waits for queued actions to drain
    #[serde(default = "default_restart_drain_timeout")]
    pub restart_drain_timeout_seconds: u64,

    /// Lifecycle event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

/// Configuration of one deployed application
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ApplicationConfig {
    /// Configuration identity, stable across updates
    pub pid: String,

    pub name: Option<String>,

    /// Path or URL of the application artifact
    pub location: Option<String>,

    /// Application type, used to select a handler
    #[serde(rename = "type")]
    pub app_type: Option<String>,

    /// Pids of applications that must be started first
    #[serde(default)]
    pub start_after: Vec<String>,

    /// Start automatically once configured
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
}

impl ApplicationConfig {
    pub fn new<P: Into<String>, N: Into<String>, L: Into<String>, T: Into<String>>(
        pid: P,
        name: N,
        location: L,
        app_type: T,
    ) -> Self {
        Self {
            pid: pid.into(),
            name: Some(name.into()),
            location: Some(location.into()),
            app_type: Some(app_type.into()),
            start_after: Vec::new(),
            auto_start: default_auto_start(),
        }
    }

    /// Human readable label used in messages
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("application {}", name),
            None => format!("application with pid {}", self.pid),
        }
    }

    pub fn app_type(&self) -> &str {
        self.app_type.as_deref().unwrap_or("")
    }

    /// Check that the application can be resolved and started
    pub fn validate(&self) -> Result<(), AppManagerError> {
        let invalid = |reason: &str| AppManagerError::InvalidApplication {
            label: self.label(),
            reason: reason.to_string(),
        };

        if self.pid.trim().is_empty() {
            return Err(invalid("pid must not be empty"));
        }
        match &self.name {
            Some(name) if !name.trim().is_empty() => {}
            _ => return Err(invalid("name is required")),
        }
        match &self.location {
            Some(location) if !location.trim().is_empty() => {}
            _ => return Err(invalid("location is required")),
        }
        match &self.app_type {
            Some(app_type) if !app_type.trim().is_empty() => {}
            _ => return Err(invalid("type is required")),
        }
        if self.start_after.iter().any(|pid| pid == &self.pid) {
            return Err(invalid("an application cannot start after itself"));
        }
        Ok(())
    }
}

impl ManagerConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("appmanager.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("server.apps_dir", path_default(default_apps_dir()))?
            .set_default(
                "server.shared_apps_dir",
                path_default(default_shared_apps_dir()),
            )?
            .set_default("server.cache_root", path_default(default_cache_root()))?
            .set_default("monitor.enabled", default_monitor_enabled())?
            .set_default("monitor.trigger", "polled")?
            .set_default("monitor.interval_ms", default_monitor_interval_ms())?
            .set_default(
                "lifecycle.slow_start_timeout_seconds",
                default_slow_start_timeout(),
            )?
            .set_default(
                "lifecycle.restart_drain_timeout_seconds",
                default_restart_drain_timeout(),
            )?
            .set_default(
                "lifecycle.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            .add_source(File::with_name(&path_str).required(false))
            .add_source(Environment::with_prefix("APPMANAGER").separator("__"))
            .build()?;

        let config: ManagerConfig = settings.try_deserialize()?;

        info!(
            "Configuration loaded with {} application(s)",
            config.applications.len()
        );
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.interval_ms == 0 {
            return Err(ConfigError::Message(
                "Monitor interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.lifecycle.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for app in &self.applications {
            if !seen.insert(app.pid.as_str()) {
                return Err(ConfigError::Message(format!(
                    "Duplicate application pid '{}'",
                    app.pid
                )));
            }
            app.validate()
                .map_err(|e| ConfigError::Message(e.to_string()))?;
        }

        Ok(())
    }

    pub fn slow_start_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle.slow_start_timeout_seconds)
    }

    pub fn restart_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle.restart_drain_timeout_seconds)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.interval_ms)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, AppManagerError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                apps_dir: default_apps_dir(),
                shared_apps_dir: default_shared_apps_dir(),
                cache_root: default_cache_root(),
            },
            monitor: MonitorConfig {
                enabled: default_monitor_enabled(),
                trigger: default_monitor_trigger(),
                interval_ms: default_monitor_interval_ms(),
            },
            lifecycle: LifecycleConfig {
                slow_start_timeout_seconds: default_slow_start_timeout(),
                restart_drain_timeout_seconds: default_restart_drain_timeout(),
                event_bus_capacity: default_event_bus_capacity(),
            },
            applications: Vec::new(),
        }
    }
}

fn path_default(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

// Default value functions
fn default_apps_dir() -> PathBuf {
    PathBuf::from("./apps")
}
fn default_shared_apps_dir() -> PathBuf {
    PathBuf::from("./shared/apps")
}
fn default_cache_root() -> PathBuf {
    PathBuf::from("./workarea")
}

fn default_monitor_enabled() -> bool {
    true
}
fn default_monitor_trigger() -> MonitorTrigger {
    MonitorTrigger::Polled
}
fn default_monitor_interval_ms() -> u64 {
    500
}

fn default_slow_start_timeout() -> u64 {
    30
}
fn default_restart_drain_timeout() -> u64 {
    30
}
fn default_event_bus_capacity() -> usize {
    256
}

fn default_auto_start() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.restart_drain_timeout(), Duration::from_secs(30));
        assert_eq!(config.monitor.trigger, MonitorTrigger::Polled);
    }

    #[test]
    fn test_application_validation() {
        let mut app = ApplicationConfig::new("app-1", "shop", "shop.war", "war");
        assert!(app.validate().is_ok());

        app.location = None;
        assert!(matches!(
            app.validate(),
            Err(AppManagerError::InvalidApplication { .. })
        ));

        app.location = Some("shop.war".to_string());
        app.start_after = vec!["app-1".to_string()];
        assert!(app.validate().is_err());
    }

    #[test]
    fn test_label_falls_back_to_pid() {
        let mut app = ApplicationConfig::new("app-9", "billing", "billing.ear", "ear");
        assert_eq!(app.label(), "application billing");
        app.name = None;
        assert_eq!(app.label(), "application with pid app-9");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
apps_dir = "/srv/apps"

[monitor]
trigger = "external"

[[applications]]
pid = "a1"
name = "inventory"
location = "inventory.war"
type = "war"
start_after = ["a0"]
"#
        )
        .unwrap();

        let config = ManagerConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.server.apps_dir, PathBuf::from("/srv/apps"));
        assert_eq!(config.monitor.trigger, MonitorTrigger::External);
        assert_eq!(config.monitor.interval_ms, 500);
        assert_eq!(config.applications.len(), 1);
        assert_eq!(config.applications[0].app_type(), "war");
        assert_eq!(config.applications[0].start_after, vec!["a0".to_string()]);
        assert!(config.applications[0].auto_start);
    }

    #[test]
    fn test_duplicate_pid_rejected() {
        let mut config = ManagerConfig::default();
        config.applications = vec![
            ApplicationConfig::new("p", "one", "one.war", "war"),
            ApplicationConfig::new("p", "two", "two.war", "war"),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_renders_as_toml() {
        let rendered = ManagerConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[server]"));
        assert!(rendered.contains("[lifecycle]"));
        assert!(rendered.contains("trigger = \"polled\""));
    }
}
