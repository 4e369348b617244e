use std::env;

/// Environment prefix that takes precedence over bare variable names, so the
/// agent can coexist with other software reading `PORT`-style variables.
pub const ENV_PREFIX: &str = "VIGIL_AGENT_";

/// Default bind address when neither LISTEN nor PORT is set.
pub const DEFAULT_LISTEN: &str = ":45876";

/// Default per-request timeout against the container engine.
pub const DEFAULT_DOCKER_TIMEOUT_MS: u64 = 2100;

/// Default restart cap for a failing GPU collector subprocess.
pub const DEFAULT_MAX_GPU_RETRIES: u32 = 5;

/// Look up an environment variable, preferring the prefixed form.
pub fn lookup_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}"))
        .or_else(|_| env::var(name))
        .ok()
        .filter(|s| !s.is_empty())
}

/// Memory accounting mode. `Htop` mirrors htop's calculation
/// (used = total − free − cache/buffers) instead of the kernel's "available".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemCalc {
    #[default]
    Default,
    Htop,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server bind address (e.g. ":45876", "0.0.0.0:45876", or a socket path).
    pub listen: String,

    /// "tcp" or "unix"; inferred from `listen` when unset.
    pub network: String,

    /// Authorized SSH public key(s), authorized_keys format (possibly
    /// multi-line). Required unless only the WebSocket transport is used.
    pub keys: Option<String>,

    /// Outbound hub WebSocket target.
    pub hub_url: Option<String>,

    /// Credential presented during the WebSocket fingerprint handshake.
    pub token: Option<String>,

    /// Persistent directory for the fingerprint.
    pub data_dir: Option<String>,

    /// Force a specific root filesystem device or mountpoint.
    pub filesystem: Option<String>,

    /// Extra tracked filesystems, each `device` or `device__customname`.
    pub extra_filesystems: Vec<ExtraFilesystem>,

    /// Interface allow list, or deny list when prefixed with `-`.
    /// `*` wildcards supported.
    pub nics: Option<String>,

    /// Container engine endpoint override.
    pub docker_host: Option<String>,

    /// Per-request timeout against the container engine.
    pub docker_timeout_ms: u64,

    /// Globs matched against container names; matches are skipped.
    pub exclude_containers: Vec<String>,

    /// Ordered priority list of GPU collector sources.
    pub gpu_collector: Option<String>,

    /// Disable the GPU subsystem entirely.
    pub skip_gpu: bool,

    /// Restart cap for a failing GPU collector.
    pub max_gpu_retries: u32,

    pub mem_calc: MemCalc,

    /// tracing env-filter directive (e.g. "debug").
    pub log_level: String,

    /// User-provided SMART device list, `device:type` pairs.
    pub smart_devices: Option<String>,

    /// Device names excluded from SMART inspection.
    pub exclude_smart: Vec<String>,

    /// Separator between `device:type` pairs in `smart_devices`.
    pub smart_devices_separator: String,

    /// Sensor reported as the dashboard temperature.
    pub primary_sensor: Option<String>,

    /// Sensor allow list, or deny list when prefixed with `-`.
    pub sensors: Option<String>,
}

/// One `EXTRA_FILESYSTEMS` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraFilesystem {
    pub device: String,
    pub custom_name: Option<String>,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let listen = lookup_env("LISTEN")
            .or_else(|| lookup_env("PORT").map(|p| format!(":{p}")))
            .unwrap_or_else(|| DEFAULT_LISTEN.into());

        let network =
            lookup_env("NETWORK").unwrap_or_else(|| infer_network(&listen).to_string());

        let keys = lookup_env("KEY").or_else(|| {
            lookup_env("KEY_FILE").and_then(|path| std::fs::read_to_string(path).ok())
        });

        Self {
            listen,
            network,
            keys,
            hub_url: lookup_env("HUB_URL"),
            token: lookup_env("TOKEN"),
            data_dir: lookup_env("DATA_DIR"),
            filesystem: lookup_env("FILESYSTEM"),
            extra_filesystems: lookup_env("EXTRA_FILESYSTEMS")
                .map(|raw| parse_extra_filesystems(&raw))
                .unwrap_or_default(),
            nics: lookup_env("NICS"),
            docker_host: lookup_env("DOCKER_HOST"),
            docker_timeout_ms: lookup_env("DOCKER_TIMEOUT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_DOCKER_TIMEOUT_MS),
            exclude_containers: lookup_env("EXCLUDE_CONTAINERS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            gpu_collector: lookup_env("GPU_COLLECTOR"),
            skip_gpu: lookup_env("SKIP_GPU")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false),
            max_gpu_retries: lookup_env("MAX_GPU_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_GPU_RETRIES),
            mem_calc: match lookup_env("MEM_CALC").as_deref() {
                Some("htop") => MemCalc::Htop,
                _ => MemCalc::Default,
            },
            log_level: lookup_env("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            smart_devices: lookup_env("SMART_DEVICES"),
            exclude_smart: lookup_env("EXCLUDE_SMART")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            smart_devices_separator: lookup_env("SMART_DEVICES_SEPARATOR")
                .unwrap_or_else(|| ",".into()),
            primary_sensor: lookup_env("PRIMARY_SENSOR"),
            sensors: lookup_env("SENSORS"),
        }
    }

    /// True when the listener is a unix domain socket.
    pub fn is_unix_socket(&self) -> bool {
        self.network == "unix"
    }

    /// The TCP bind address with a default host filled in for bare ":port"
    /// values. Meaningless for unix sockets.
    pub fn tcp_bind_addr(&self) -> String {
        if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        }
    }

    /// The port half of the listen address, used in the fingerprint reply so
    /// the hub can dial back over SSH.
    pub fn listen_port(&self) -> String {
        self.listen
            .rsplit(':')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

fn infer_network(listen: &str) -> &'static str {
    if listen.starts_with('/') {
        "unix"
    } else {
        "tcp"
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_extra_filesystems(raw: &str) -> Vec<ExtraFilesystem> {
    split_list(raw)
        .into_iter()
        .map(|entry| match entry.split_once("__") {
            Some((device, name)) if !name.is_empty() => ExtraFilesystem {
                device: device.to_string(),
                custom_name: Some(name.to_string()),
            },
            _ => ExtraFilesystem {
                device: entry,
                custom_name: None,
            },
        })
        .collect()
}

/// Build a minimal `AgentConfig` with all fields defaulted. Tests override
/// specific fields via struct update syntax.
#[cfg(test)]
pub(crate) fn base_config() -> AgentConfig {
    AgentConfig {
        listen: DEFAULT_LISTEN.into(),
        network: "tcp".into(),
        keys: None,
        hub_url: None,
        token: None,
        data_dir: None,
        filesystem: None,
        extra_filesystems: Vec::new(),
        nics: None,
        docker_host: None,
        docker_timeout_ms: DEFAULT_DOCKER_TIMEOUT_MS,
        exclude_containers: Vec::new(),
        gpu_collector: None,
        skip_gpu: false,
        max_gpu_retries: DEFAULT_MAX_GPU_RETRIES,
        mem_calc: MemCalc::Default,
        log_level: "info".into(),
        smart_devices: None,
        exclude_smart: Vec::new(),
        smart_devices_separator: ",".into(),
        primary_sensor: None,
        sensors: None,
    }
}
