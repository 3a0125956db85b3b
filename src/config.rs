//! Route and server configuration
//!
//! Routes are declared in TOML as a map from path prefix to either a bare
//! command string, a command-plus-argument list, or a full table:
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0"
//! port = 8000
//!
//! [routes]
//! "/a" = "python scriptA.py"
//! "/b" = ["python", "scriptB.py", "--flag"]
//!
//! [routes."/cli"]
//! command = "python"
//! args = ["repl.py"]
//! title = "REPL"
//! max_clients = 2
//! ```

use crate::error::Error;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub defaults: RouteDefaults,
    /// Routes in declaration order, paths normalized and unique
    pub routes: Vec<Route>,
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    defaults: RouteDefaults,
    #[serde(default)]
    routes: HashMap<String, RouteSpec>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the external listener (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// External port (default: 8000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Explicit path to the terminal backend binary. When unset, routes
    /// without a `command` resolve the binary from PATH at startup.
    pub backend_binary: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            backend_binary: None,
        }
    }
}

/// Default settings shared by all routes unless overridden per route
#[derive(Debug, Deserialize, Clone)]
pub struct RouteDefaults {
    /// First port probed when allocating backend ports (default: 7681)
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Maximum number of ports probed before giving up
    #[serde(default = "default_port_probe_limit")]
    pub port_probe_limit: u32,

    /// Concurrent sessions allowed per route (default: 1, the usual
    /// one-client-at-a-time terminal backend behavior)
    #[serde(default = "default_max_clients")]
    pub max_clients: u32,

    /// Seconds to wait for a spawned backend to start listening
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Milliseconds between listening-confirmation connect probes
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Seconds between SIGTERM and SIGKILL on stop
    #[serde(default = "default_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Overall deadline for stop_all in seconds
    #[serde(default = "default_shutdown_deadline")]
    pub shutdown_deadline_secs: u64,

    /// Crash restarts attempted before a route goes terminally Failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial restart backoff in milliseconds (doubles per attempt)
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Upper bound on the restart backoff in milliseconds
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,

    /// Spawn backends on first request instead of at startup
    #[serde(default)]
    pub lazy_start: bool,

    /// Require the Origin header to match the Host on WebSocket upgrades
    #[serde(default = "default_check_origin")]
    pub check_origin: bool,

    /// Max seconds to wait for a proxied HTTP response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for RouteDefaults {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            port_probe_limit: default_port_probe_limit(),
            max_clients: default_max_clients(),
            startup_timeout_secs: default_startup_timeout(),
            probe_interval_ms: default_probe_interval(),
            shutdown_grace_period_secs: default_grace_period(),
            shutdown_deadline_secs: default_shutdown_deadline(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
            lazy_start: false,
            check_origin: default_check_origin(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl RouteDefaults {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs)
    }
}

/// Environment-forwarding policy for a backend process.
///
/// Declared in configuration as a bool (forward everything / nothing), a
/// list of key names to forward, or a map of literal overrides where a null
/// value means "inherit this key from the parent".
#[derive(Debug, Clone, PartialEq)]
pub enum EnvPolicy {
    /// Forward the entire parent environment
    All,
    /// Forward nothing
    None,
    /// Forward exactly the named keys from the parent
    Selected(Vec<String>),
    /// Exactly the named keys: literal values, or parent's value when null
    Overrides(HashMap<String, Option<String>>),
}

impl Default for EnvPolicy {
    fn default() -> Self {
        EnvPolicy::All
    }
}

impl EnvPolicy {
    /// Resolve the policy against a parent environment into the concrete
    /// environment map handed to the subprocess.
    pub fn resolve(&self, parent: &HashMap<String, String>) -> HashMap<String, String> {
        match self {
            EnvPolicy::All => parent.clone(),
            EnvPolicy::None => HashMap::new(),
            EnvPolicy::Selected(keys) => keys
                .iter()
                .filter_map(|k| parent.get(k).map(|v| (k.clone(), v.clone())))
                .collect(),
            EnvPolicy::Overrides(map) => map
                .iter()
                .filter_map(|(k, v)| match v {
                    Some(literal) => Some((k.clone(), literal.clone())),
                    None => parent.get(k).map(|p| (k.clone(), p.clone())),
                })
                .collect(),
        }
    }
}

impl<'de> Deserialize<'de> for EnvPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Forward(bool),
            Selected(Vec<String>),
            Overrides(HashMap<String, Option<String>>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Forward(true) => EnvPolicy::All,
            Raw::Forward(false) => EnvPolicy::None,
            Raw::Selected(keys) => EnvPolicy::Selected(keys),
            Raw::Overrides(map) => EnvPolicy::Overrides(map),
        })
    }
}

/// A route as written in configuration: bare command, argv list, or table
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum RouteSpec {
    Command(String),
    Argv(Vec<String>),
    Table(RouteTable),
}

#[derive(Debug, Deserialize, Clone, Default)]
struct RouteTable {
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    title: Option<String>,
    #[serde(default)]
    theme: HashMap<String, String>,
    port: Option<u16>,
    max_clients: Option<u32>,
    #[serde(default)]
    env: EnvPolicy,
    lazy_start: Option<bool>,
    check_origin: Option<bool>,
    startup_timeout_secs: Option<u64>,
    shutdown_grace_period_secs: Option<u64>,
    max_retries: Option<u32>,
    request_timeout_secs: Option<u64>,
}

/// One configured route: a path prefix mapped to a backend command.
///
/// Immutable once the route set is built; the registry and router share it
/// by clone.
#[derive(Debug, Clone)]
pub struct Route {
    /// Normalized path prefix: leading '/', no trailing '/' except root
    pub path: String,
    /// Command to run. None means the provisioned backend binary.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub title: Option<String>,
    /// Opaque theme attributes carried through to the backend
    pub theme: HashMap<String, String>,
    /// Fixed backend port; allocated from the pool when unset
    pub port: Option<u16>,
    pub max_clients: Option<u32>,
    pub env: EnvPolicy,
    pub lazy_start: Option<bool>,
    pub check_origin: Option<bool>,
    pub startup_timeout_secs: Option<u64>,
    pub shutdown_grace_period_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub request_timeout_secs: Option<u64>,
}

impl Route {
    /// Minimal route for a command, used widely in tests
    pub fn new(path: &str, command: &str, args: Vec<String>) -> Self {
        Self {
            path: path.to_string(),
            command: Some(command.to_string()),
            args,
            title: None,
            theme: HashMap::new(),
            port: None,
            max_clients: None,
            env: EnvPolicy::All,
            lazy_start: None,
            check_origin: None,
            startup_timeout_secs: None,
            shutdown_grace_period_secs: None,
            max_retries: None,
            request_timeout_secs: None,
        }
    }

    pub fn max_clients(&self, defaults: &RouteDefaults) -> u32 {
        self.max_clients.unwrap_or(defaults.max_clients)
    }

    pub fn lazy_start(&self, defaults: &RouteDefaults) -> bool {
        self.lazy_start.unwrap_or(defaults.lazy_start)
    }

    pub fn check_origin(&self, defaults: &RouteDefaults) -> bool {
        self.check_origin.unwrap_or(defaults.check_origin)
    }

    pub fn startup_timeout(&self, defaults: &RouteDefaults) -> Duration {
        Duration::from_secs(
            self.startup_timeout_secs
                .unwrap_or(defaults.startup_timeout_secs),
        )
    }

    pub fn grace_period(&self, defaults: &RouteDefaults) -> Duration {
        Duration::from_secs(
            self.shutdown_grace_period_secs
                .unwrap_or(defaults.shutdown_grace_period_secs),
        )
    }

    pub fn max_retries(&self, defaults: &RouteDefaults) -> u32 {
        self.max_retries.unwrap_or(defaults.max_retries)
    }

    pub fn request_timeout(&self, defaults: &RouteDefaults) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .unwrap_or(defaults.request_timeout_secs),
        )
    }
}

/// Normalize a route path: ensure a leading '/', strip any trailing '/'
/// (except for the root route itself).
pub fn normalize_path(path: &str) -> String {
    let mut p = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    while p.len() > 1 && p.ends_with('/') {
        p.pop();
    }
    p
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::configuration(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, Error> {
        let raw: RawConfig = toml::from_str(content)
            .map_err(|e| Error::configuration(format!("failed to parse config: {}", e)))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, Error> {
        let mut routes = Vec::with_capacity(raw.routes.len());
        let mut seen = std::collections::HashSet::new();

        // Sort for deterministic route order; the map itself is unordered
        let mut specs: Vec<(String, RouteSpec)> = raw.routes.into_iter().collect();
        specs.sort_by(|a, b| a.0.cmp(&b.0));

        for (path, spec) in specs {
            let path = normalize_path(&path);
            if !seen.insert(path.clone()) {
                return Err(Error::configuration(format!(
                    "duplicate route path: {}",
                    path
                )));
            }
            routes.push(build_route(path, spec)?);
        }

        let config = Config {
            server: raw.server,
            defaults: raw.defaults,
            routes,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        let mut fixed_ports = std::collections::HashSet::new();
        for route in &self.routes {
            if let Some(port) = route.port {
                if !fixed_ports.insert(port) {
                    return Err(Error::configuration(format!(
                        "fixed port {} assigned to more than one route",
                        port
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up a route by its exact normalized path
    pub fn route(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.path == path)
    }
}

fn build_route(path: String, spec: RouteSpec) -> Result<Route, Error> {
    match spec {
        RouteSpec::Command(cmdline) => {
            let mut words = shell_words::split(&cmdline).map_err(|e| {
                Error::configuration(format!("route {}: bad command string: {}", path, e))
            })?;
            if words.is_empty() {
                return Err(Error::configuration(format!(
                    "route {}: empty command",
                    path
                )));
            }
            let command = words.remove(0);
            Ok(Route::new(&path, &command, words))
        }
        RouteSpec::Argv(argv) => {
            let mut argv = argv;
            if argv.is_empty() {
                return Err(Error::configuration(format!(
                    "route {}: empty command list",
                    path
                )));
            }
            let command = argv.remove(0);
            Ok(Route::new(&path, &command, argv))
        }
        RouteSpec::Table(t) => Ok(Route {
            path,
            command: t.command,
            args: t.args,
            title: t.title,
            theme: t.theme,
            port: t.port,
            max_clients: t.max_clients,
            env: t.env,
            lazy_start: t.lazy_start,
            check_origin: t.check_origin,
            startup_timeout_secs: t.startup_timeout_secs,
            shutdown_grace_period_secs: t.shutdown_grace_period_secs,
            max_retries: t.max_retries,
            request_timeout_secs: t.request_timeout_secs,
        }),
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8000
}

fn default_base_port() -> u16 {
    7681
}

fn default_port_probe_limit() -> u32 {
    100
}

fn default_max_clients() -> u32 {
    1
}

fn default_startup_timeout() -> u64 {
    10
}

fn default_probe_interval() -> u64 {
    100
}

fn default_grace_period() -> u64 {
    5
}

fn default_shutdown_deadline() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    500
}

fn default_backoff_cap() -> u64 {
    8000
}

fn default_check_origin() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent_env() -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/usr/bin".to_string());
        env.insert("HOME".to_string(), "/home/user".to_string());
        env.insert("X".to_string(), "parent-x".to_string());
        env
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/cli"), "/cli");
        assert_eq!(normalize_path("cli"), "/cli");
        assert_eq!(normalize_path("/cli/"), "/cli");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/cli/sub/"), "/cli/sub");
    }

    #[test]
    fn test_env_policy_all() {
        let parent = parent_env();
        let resolved = EnvPolicy::All.resolve(&parent);
        assert_eq!(resolved, parent);
    }

    #[test]
    fn test_env_policy_none() {
        let resolved = EnvPolicy::None.resolve(&parent_env());
        assert!(resolved.is_empty());
    }

    #[test]
    fn test_env_policy_selected() {
        let policy = EnvPolicy::Selected(vec![
            "PATH".to_string(),
            "X".to_string(),
            "MISSING".to_string(),
        ]);
        let resolved = policy.resolve(&parent_env());
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved.get("PATH").unwrap(), "/usr/bin");
        assert_eq!(resolved.get("X").unwrap(), "parent-x");
        assert!(!resolved.contains_key("HOME"));
    }

    #[test]
    fn test_env_policy_overrides() {
        let mut map = HashMap::new();
        map.insert("X".to_string(), Some("1".to_string()));
        map.insert("PATH".to_string(), None);
        let resolved = EnvPolicy::Overrides(map).resolve(&parent_env());
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved.get("X").unwrap(), "1");
        assert_eq!(resolved.get("PATH").unwrap(), "/usr/bin");
    }

    #[test]
    fn test_env_policy_deserialize_bool_and_list() {
        let policy: EnvPolicy = serde_json::from_str("true").unwrap();
        assert_eq!(policy, EnvPolicy::All);

        let policy: EnvPolicy = serde_json::from_str("false").unwrap();
        assert_eq!(policy, EnvPolicy::None);

        let policy: EnvPolicy = serde_json::from_str(r#"["PATH", "X"]"#).unwrap();
        assert_eq!(
            policy,
            EnvPolicy::Selected(vec!["PATH".to_string(), "X".to_string()])
        );
    }

    #[test]
    fn test_env_policy_deserialize_override_map() {
        let policy: EnvPolicy = serde_json::from_str(r#"{"X": "1", "PATH": null}"#).unwrap();
        let mut expected = HashMap::new();
        expected.insert("X".to_string(), Some("1".to_string()));
        expected.insert("PATH".to_string(), None);
        assert_eq!(policy, EnvPolicy::Overrides(expected));
    }

    #[test]
    fn test_parse_bare_command_route() {
        let config = Config::from_toml(
            r#"
            [routes]
            "/a" = "python scriptA.py --verbose"
            "#,
        )
        .unwrap();

        let route = config.route("/a").unwrap();
        assert_eq!(route.command.as_deref(), Some("python"));
        assert_eq!(route.args, vec!["scriptA.py", "--verbose"]);
    }

    #[test]
    fn test_parse_argv_route() {
        let config = Config::from_toml(
            r#"
            [routes]
            "/b" = ["python", "scriptB.py", "--flag"]
            "#,
        )
        .unwrap();

        let route = config.route("/b").unwrap();
        assert_eq!(route.command.as_deref(), Some("python"));
        assert_eq!(route.args, vec!["scriptB.py", "--flag"]);
    }

    #[test]
    fn test_parse_table_route() {
        let config = Config::from_toml(
            r#"
            [routes."/cli"]
            command = "python"
            args = ["repl.py"]
            title = "REPL"
            port = 7700
            max_clients = 2
            env = ["PATH", "TERM"]
            "#,
        )
        .unwrap();

        let route = config.route("/cli").unwrap();
        assert_eq!(route.command.as_deref(), Some("python"));
        assert_eq!(route.title.as_deref(), Some("REPL"));
        assert_eq!(route.port, Some(7700));
        assert_eq!(route.max_clients, Some(2));
        assert_eq!(
            route.env,
            EnvPolicy::Selected(vec!["PATH".to_string(), "TERM".to_string()])
        );
    }

    #[test]
    fn test_duplicate_route_after_normalization() {
        let err = Config::from_toml(
            r#"
            [routes]
            "/cli" = "python a.py"
            "cli/" = "python b.py"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate route path"));
    }

    #[test]
    fn test_duplicate_fixed_port_rejected() {
        let err = Config::from_toml(
            r#"
            [routes."/a"]
            command = "python"
            port = 7700

            [routes."/b"]
            command = "python"
            port = 7700
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("fixed port"));
    }

    #[test]
    fn test_empty_command_rejected() {
        let err = Config::from_toml(
            r#"
            [routes]
            "/a" = ""
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("empty command"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.defaults.base_port, 7681);
        assert_eq!(config.defaults.max_clients, 1);
        assert_eq!(config.defaults.max_retries, 3);
        assert!(config.defaults.check_origin);
        assert!(!config.defaults.lazy_start);
    }

    #[test]
    fn test_route_setting_accessors() {
        let defaults = RouteDefaults::default();
        let mut route = Route::new("/cli", "python", vec![]);
        assert_eq!(route.max_clients(&defaults), 1);
        assert_eq!(route.startup_timeout(&defaults), Duration::from_secs(10));
        assert_eq!(route.grace_period(&defaults), Duration::from_secs(5));
        assert_eq!(route.max_retries(&defaults), 3);

        route.max_clients = Some(4);
        route.max_retries = Some(0);
        assert_eq!(route.max_clients(&defaults), 4);
        assert_eq!(route.max_retries(&defaults), 0);
    }

    #[test]
    fn test_config_file_load() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [server]
            port = 9000

            [routes]
            "/a" = "sleep 60"
            "#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.routes.len(), 1);
    }
}
