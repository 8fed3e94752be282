//! Broker configuration sourced from the host's settings registry.

use serde_json::{json, Map, Value};

/// Options governing a compiler pool, snapshotted at pool construction.
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Log transport failures and bad units at error level.
    pub verbose_errors: bool,
    /// Extra attempts after a transport failure; 0 means a single attempt.
    pub max_retries: u64,
    /// Number of worker processes in the pool.
    pub workers: u64,
    /// Executable path plus arguments, whitespace-separated.
    pub command: String,
    /// Forward the host's settings to each worker at startup.
    pub inherit_config: bool,
    /// Compilations before a worker is recycled; 0 disables recycling.
    pub reset_threshold: u64,
}

/// Host-side settings consulted by the broker.
///
/// Queried once when the pool is built, and again on every worker start for
/// the config payloads, so a restarted worker observes current host state.
pub trait ConfigRegistry: Send + Sync {
    /// Master switch for the external compiler.
    fn enabled(&self) -> bool {
        true
    }

    /// Fall back to an in-process compiler on error instead of fataling.
    fn fallback(&self) -> bool {
        false
    }

    fn verbose_errors(&self) -> bool {
        true
    }

    fn max_retries(&self) -> u64 {
        0
    }

    fn workers(&self) -> u64 {
        2
    }

    /// Worker command line; empty disables the external compiler.
    fn command(&self) -> String {
        String::new()
    }

    fn inherit_config(&self) -> bool {
        true
    }

    fn reset_threshold(&self) -> u64 {
        0
    }

    /// Use the external compiler while the systemlib is still loading.
    fn use_for_systemlib(&self) -> bool {
        false
    }

    /// JSON dump of every host setting, sent in the first config frame.
    fn globals_as_json(&self) -> String {
        String::new()
    }

    /// Value for the `hhvm.include_roots` entry of the second config frame.
    fn include_roots(&self) -> Value {
        Value::Object(Map::new())
    }
}

/// How compile errors from the external compiler surface to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HackcMode {
    /// External compilation is disabled or misconfigured.
    Never,
    /// On error the caller should fall back to an in-process compiler.
    Fallback,
    /// Errors become synthetic fatal units.
    Fatal,
}

/// Derive the operating mode from the registry.
pub fn mode_of(registry: &dyn ConfigRegistry) -> HackcMode {
    if !registry.enabled() {
        return HackcMode::Never;
    }
    if registry.command().is_empty() || registry.workers() == 0 {
        return HackcMode::Never;
    }
    if registry.fallback() {
        return HackcMode::Fallback;
    }
    HackcMode::Fatal
}

/// Snapshot pool options, or `None` when the mode works out to `Never`.
pub fn options_from(registry: &dyn ConfigRegistry) -> Option<CompilerOptions> {
    if mode_of(registry) == HackcMode::Never {
        return None;
    }
    Some(CompilerOptions {
        verbose_errors: registry.verbose_errors(),
        max_retries: registry.max_retries(),
        workers: registry.workers(),
        command: registry.command(),
        inherit_config: registry.inherit_config(),
        reset_threshold: registry.reset_threshold(),
    })
}

/// Builds the miscellaneous-settings payload of the second config frame.
///
/// Each field is wrapped as `{"global_value": ...}`; an empty builder
/// serializes to the empty string, which the worker reads as "no settings".
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Option<Map<String, Value>>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_field(mut self, key: &str, value: Value) -> Self {
        self.config
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), json!({ "global_value": value }));
        self
    }

    pub fn into_string(self) -> String {
        match self.config {
            Some(fields) => Value::Object(fields).to_string(),
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeRegistry {
        enabled: bool,
        fallback: bool,
        workers: u64,
        command: &'static str,
    }

    impl ConfigRegistry for FakeRegistry {
        fn enabled(&self) -> bool {
            self.enabled
        }
        fn fallback(&self) -> bool {
            self.fallback
        }
        fn workers(&self) -> u64 {
            self.workers
        }
        fn command(&self) -> String {
            self.command.to_string()
        }
    }

    fn registry(enabled: bool, fallback: bool, workers: u64, command: &'static str) -> FakeRegistry {
        FakeRegistry {
            enabled,
            fallback,
            workers,
            command,
        }
    }

    #[test]
    fn test_mode_disabled() {
        assert_eq!(mode_of(&registry(false, false, 2, "hackc")), HackcMode::Never);
    }

    #[test]
    fn test_mode_misconfigured() {
        assert_eq!(mode_of(&registry(true, false, 2, "")), HackcMode::Never);
        assert_eq!(mode_of(&registry(true, false, 0, "hackc")), HackcMode::Never);
    }

    #[test]
    fn test_mode_fallback_and_fatal() {
        assert_eq!(
            mode_of(&registry(true, true, 2, "hackc")),
            HackcMode::Fallback
        );
        assert_eq!(mode_of(&registry(true, false, 2, "hackc")), HackcMode::Fatal);
    }

    #[test]
    fn test_options_follow_mode() {
        assert!(options_from(&registry(false, false, 2, "hackc")).is_none());

        let options = options_from(&registry(true, false, 3, "hackc --daemon")).unwrap();
        assert_eq!(options.workers, 3);
        assert_eq!(options.command, "hackc --daemon");
        assert_eq!(options.max_retries, 0);
        assert!(options.inherit_config);
    }

    #[test]
    fn test_config_builder_empty() {
        assert_eq!(ConfigBuilder::new().into_string(), "");
    }

    #[test]
    fn test_config_builder_wraps_global_value() {
        let payload = ConfigBuilder::new()
            .add_field("hhvm.include_roots", json!({"root": "/var/www"}))
            .into_string();
        let parsed: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(
            parsed["hhvm.include_roots"]["global_value"]["root"],
            "/var/www"
        );
    }
}
