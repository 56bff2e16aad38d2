use crate::error::{Result, StackupError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

/// The container runtime the cluster driver talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Group whose membership grants unprivileged access to the runtime socket.
    #[serde(default = "default_runtime_group")]
    pub group: String,
    /// systemd unit started when the daemon is not answering.
    #[serde(default = "default_runtime_service")]
    pub service: String,
}

fn default_runtime_group() -> String {
    "docker".to_string()
}

fn default_runtime_service() -> String {
    "docker".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            group: default_runtime_group(),
            service: default_runtime_service(),
        }
    }
}

// ---------------------------------------------------------------------------
// ClusterConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_kubernetes_version")]
    pub kubernetes_version: String,
    #[serde(default = "default_node_timeout")]
    pub ready_timeout_secs: u64,
}

fn default_profile() -> String {
    "minikube".to_string()
}

fn default_driver() -> String {
    "docker".to_string()
}

fn default_cpus() -> u32 {
    4
}

fn default_memory_mb() -> u32 {
    8192
}

fn default_kubernetes_version() -> String {
    "v1.30.0".to_string()
}

fn default_node_timeout() -> u64 {
    300
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            driver: default_driver(),
            cpus: default_cpus(),
            memory_mb: default_memory_mb(),
            kubernetes_version: default_kubernetes_version(),
            ready_timeout_secs: default_node_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// IngressConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngressConfig {
    #[serde(default = "default_addon")]
    pub addon: String,
    #[serde(default = "default_ingress_namespace")]
    pub namespace: String,
    #[serde(default = "default_ingress_selector")]
    pub selector: String,
    #[serde(default = "default_ingress_timeout")]
    pub timeout_secs: u64,
}

fn default_addon() -> String {
    "ingress".to_string()
}

fn default_ingress_namespace() -> String {
    "ingress-nginx".to_string()
}

fn default_ingress_selector() -> String {
    "app.kubernetes.io/component=controller".to_string()
}

fn default_ingress_timeout() -> u64 {
    300
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            addon: default_addon(),
            namespace: default_ingress_namespace(),
            selector: default_ingress_selector(),
            timeout_secs: default_ingress_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// InfraConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InfraConfig {
    /// Directory holding the namespace and release definitions.
    #[serde(default = "default_infra_dir")]
    pub dir: PathBuf,
}

fn default_infra_dir() -> PathBuf {
    PathBuf::from(paths::DEFAULT_INFRA_DIR)
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            dir: default_infra_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// NamespaceWaitConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamespaceWaitConfig {
    #[serde(default = "default_app_namespace")]
    pub namespace: String,
    #[serde(default = "default_ns_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_ns_interval")]
    pub interval_secs: u64,
}

fn default_app_namespace() -> String {
    "keycloak".to_string()
}

fn default_ns_attempts() -> u32 {
    60
}

fn default_ns_interval() -> u64 {
    2
}

impl Default for NamespaceWaitConfig {
    fn default() -> Self {
        Self {
            namespace: default_app_namespace(),
            max_attempts: default_ns_attempts(),
            interval_secs: default_ns_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkloadsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkloadConfig {
    pub selector: String,
    pub timeout_secs: u64,
}

/// Each workload has its own defaults, so partial sections are merged over
/// them instead of using per-field defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WorkloadsFile")]
pub struct WorkloadsConfig {
    pub database: WorkloadConfig,
    pub application: WorkloadConfig,
    /// Pause between `kubectl wait` calls that failed fast (no pods yet).
    pub poll_interval_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkloadOverride {
    selector: Option<String>,
    timeout_secs: Option<u64>,
}

impl WorkloadOverride {
    fn over(self, base: WorkloadConfig) -> WorkloadConfig {
        WorkloadConfig {
            selector: self.selector.unwrap_or(base.selector),
            timeout_secs: self.timeout_secs.unwrap_or(base.timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkloadsFile {
    #[serde(default)]
    database: WorkloadOverride,
    #[serde(default)]
    application: WorkloadOverride,
    #[serde(default = "default_workload_interval")]
    poll_interval_secs: u64,
}

impl From<WorkloadsFile> for WorkloadsConfig {
    fn from(file: WorkloadsFile) -> Self {
        Self {
            database: file.database.over(default_database()),
            application: file.application.over(default_application()),
            poll_interval_secs: file.poll_interval_secs,
        }
    }
}

fn default_database() -> WorkloadConfig {
    WorkloadConfig {
        selector: "app.kubernetes.io/name=postgresql".to_string(),
        timeout_secs: 600,
    }
}

fn default_application() -> WorkloadConfig {
    // The application server can take tens of minutes on a loaded host.
    WorkloadConfig {
        selector: "app.kubernetes.io/name=keycloak".to_string(),
        timeout_secs: 1200,
    }
}

fn default_workload_interval() -> u64 {
    5
}

impl Default for WorkloadsConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            application: default_application(),
            poll_interval_secs: default_workload_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// HealthConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default = "default_health_service")]
    pub service: String,
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_health_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_health_service() -> String {
    "keycloak".to_string()
}

fn default_remote_port() -> u16 {
    9000
}

fn default_local_port() -> u16 {
    19000
}

fn default_health_path() -> String {
    "/health/ready".to_string()
}

fn default_health_attempts() -> u32 {
    90
}

fn default_health_interval() -> u64 {
    2
}

fn default_request_timeout() -> u64 {
    5
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            service: default_health_service(),
            remote_port: default_remote_port(),
            local_port: default_local_port(),
            path: default_health_path(),
            max_attempts: default_health_attempts(),
            interval_secs: default_health_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// ToolVersions
// ---------------------------------------------------------------------------

/// Pinned versions fetched when a tool is absent. Present tools are never
/// compared against these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolVersions {
    #[serde(default = "default_minikube_version")]
    pub minikube: String,
    #[serde(default = "default_kubectl_version")]
    pub kubectl: String,
    #[serde(default = "default_helm_version")]
    pub helm: String,
    #[serde(default = "default_terraform_version")]
    pub terraform: String,
}

fn default_minikube_version() -> String {
    "v1.33.1".to_string()
}

fn default_kubectl_version() -> String {
    "v1.30.0".to_string()
}

fn default_helm_version() -> String {
    "v3.15.2".to_string()
}

fn default_terraform_version() -> String {
    "1.8.5".to_string()
}

impl Default for ToolVersions {
    fn default() -> Self {
        Self {
            minikube: default_minikube_version(),
            kubectl: default_kubectl_version(),
            helm: default_helm_version(),
            terraform: default_terraform_version(),
        }
    }
}

// ---------------------------------------------------------------------------
// AccessConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessConfig {
    /// Host name routed by the ingress to the application.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Service port used for the manual port-forward fallback.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_hostname() -> String {
    "keycloak.local".to_string()
}

fn default_http_port() -> u16 {
    80
}

impl AccessConfig {
    /// Local end of the manual port-forward. Privileged ports need root to
    /// bind, so they map to 8080.
    pub fn local_port(&self) -> u16 {
        if self.http_port < 1024 {
            8080
        } else {
            self.http_port
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            http_port: default_http_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub infra: InfraConfig,
    #[serde(default)]
    pub namespace_wait: NamespaceWaitConfig,
    #[serde(default)]
    pub workloads: WorkloadsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub tools: ToolVersions,
    #[serde(default)]
    pub access: AccessConfig,
}

impl Config {
    /// Load `stackup.yaml` from `root`, falling back to defaults when the file
    /// is absent, then apply `STACKUP_*` environment overrides.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        let mut cfg = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            serde_yaml::from_str::<Config>(&data)?
        } else {
            Config::default()
        };
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup("STACKUP_HEALTH_ATTEMPTS") {
            self.health.max_attempts = parse_override("STACKUP_HEALTH_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = lookup("STACKUP_APP_TIMEOUT_SECS") {
            self.workloads.application.timeout_secs =
                parse_override("STACKUP_APP_TIMEOUT_SECS", &raw)?;
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        if self.namespace_wait.max_attempts == 0 {
            error("namespace_wait.max_attempts is 0; the namespace can never be observed".into());
        }
        if self.health.max_attempts == 0 {
            error("health.max_attempts is 0; the health check would never run".into());
        }
        if self.health.local_port == 0 {
            error("health.local_port must be a fixed, non-zero port".into());
        }
        if self.cluster.cpus == 0 || self.cluster.memory_mb == 0 {
            error("cluster.cpus and cluster.memory_mb must be non-zero".into());
        }

        if self.cluster.memory_mb < 4096 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "cluster.memory_mb={} is below 4096; the application server may never become ready",
                    self.cluster.memory_mb
                ),
            });
        }
        if self.namespace_wait.interval_secs == 0
            || self.health.interval_secs == 0
            || self.workloads.poll_interval_secs == 0
        {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "a zero poll interval turns waits into busy loops".into(),
            });
        }
        if self.health.local_port == self.access.local_port() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "health.local_port {} is also the port-forward port suggested for access",
                    self.health.local_port
                ),
            });
        }
        if self.workloads.application.timeout_secs < self.workloads.database.timeout_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "the application timeout is shorter than the database timeout".into(),
            });
        }

        warnings
    }

    pub fn has_errors(warnings: &[ConfigWarning]) -> bool {
        warnings.iter().any(|w| w.level == WarnLevel::Error)
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| StackupError::InvalidConfig(format!("{key}={raw:?} is not a number")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.cluster.cpus, 4);
        assert_eq!(cfg.cluster.memory_mb, 8192);
        assert_eq!(cfg.namespace_wait.max_attempts, 60);
        assert_eq!(cfg.namespace_wait.interval_secs, 2);
        assert_eq!(cfg.runtime.group, "docker");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("stackup.yaml"),
            "cluster:\n  cpus: 6\nhealth:\n  service: api\n",
        )
        .unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.cluster.cpus, 6);
        assert_eq!(cfg.cluster.driver, "docker");
        assert_eq!(cfg.health.service, "api");
        assert_eq!(cfg.health.max_attempts, 90);
    }

    #[test]
    fn typo_in_section_is_rejected() {
        let yaml = "cluster:\n  cpu: 6\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("STACKUP_HEALTH_ATTEMPTS", "12"),
            ("STACKUP_APP_TIMEOUT_SECS", "2400"),
        ]
        .into_iter()
        .collect();
        let mut cfg = Config::default();
        cfg.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.health.max_attempts, 12);
        assert_eq!(cfg.workloads.application.timeout_secs, 2400);
    }

    #[test]
    fn bad_env_override_is_an_error() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_env_overrides(|k| (k == "STACKUP_HEALTH_ATTEMPTS").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, StackupError::InvalidConfig(_)));
    }

    #[test]
    fn defaults_validate_cleanly() {
        assert!(Config::default().validate().is_empty());
    }

    #[test]
    fn zero_attempts_is_an_error() {
        let mut cfg = Config::default();
        cfg.health.max_attempts = 0;
        let warnings = cfg.validate();
        assert!(Config::has_errors(&warnings));
    }

    #[test]
    fn low_memory_is_only_a_warning() {
        let mut cfg = Config::default();
        cfg.cluster.memory_mb = 2048;
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, WarnLevel::Warning);
    }

    #[test]
    fn partial_workload_section_keeps_its_own_defaults() {
        let yaml = "workloads:\n  application:\n    timeout_secs: 2400\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.workloads.application.timeout_secs, 2400);
        assert_eq!(
            cfg.workloads.application.selector,
            "app.kubernetes.io/name=keycloak"
        );
        assert_eq!(cfg.workloads.database, Config::default().workloads.database);
        assert_eq!(cfg.workloads.poll_interval_secs, 5);
    }

    #[test]
    fn typo_in_workload_section_is_rejected() {
        let yaml = "workloads:\n  database:\n    timeout: 60\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn zero_workload_interval_is_flagged() {
        let mut cfg = Config::default();
        cfg.workloads.poll_interval_secs = 0;
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("busy loops"));
    }

    #[test]
    fn health_port_colliding_with_access_port_is_flagged() {
        let mut cfg = Config::default();
        cfg.health.local_port = 8080;
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, WarnLevel::Warning);
        assert!(warnings[0].message.contains("8080"));
    }

    #[test]
    fn yaml_roundtrip_preserves_values() {
        let mut cfg = Config::default();
        cfg.access.hostname = "auth.test".into();
        let yaml = cfg.to_yaml().unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, cfg);
    }
}
