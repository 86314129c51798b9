//! Plugin hook tables.
//!
//! Three optional hooks customize a deployment: platform identification
//! (naming the platform and compiler from the option set), platform
//! initialization (mutating attributes and binding a batch system), and
//! user test validation (vetoing individual tests). Each is a trait with
//! a compiled-in stub default; a deployment registers its own
//! implementations on the [`PluginSet`] at startup.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Mutex;

use tracing::warn;

use crate::platform::PlatformConfig;

/// The option dictionary handed to identification hooks: the `--plat`,
/// `-o`, and `-O` values as given on the command line.
#[derive(Debug, Default, Clone)]
pub struct PluginOptions {
    pub platname: Option<String>,
    pub on_options: Vec<String>,
    pub off_options: Vec<String>,
}

/// Names the platform and compiler for this invocation.
pub trait IdPlatform: Send + Sync {
    /// A platform name, or `None` to fall back to the OS name.
    fn platform(&self, _opts: &PluginOptions) -> Option<String> {
        None
    }

    /// A compiler name for the platform, or `None` when not applicable.
    fn compiler(&self, _platname: &str, _opts: &PluginOptions) -> Option<String> {
        None
    }
}

/// Mutates the platform configuration before pools are sized: setting
/// attributes, environment entries, and the batch system binding.
pub trait PlatformPlugin: Send + Sync {
    fn initialize(&self, _platcfg: &mut PlatformConfig) {}
}

/// The per-test facts given to user validation.
#[derive(Debug, Clone, Default)]
pub struct ValidateSpecs {
    pub name: String,
    pub keywords: Vec<String>,
    pub parameters: BTreeMap<String, String>,
}

/// Vetoes individual tests. A returned string skips the test with that
/// text as the reason.
pub trait UserPlugin: Send + Sync {
    fn validate_test(&self, _specs: &ValidateSpecs) -> Option<String> {
        None
    }
}

struct StubPlugins;

impl IdPlatform for StubPlugins {}
impl PlatformPlugin for StubPlugins {}
impl UserPlugin for StubPlugins {}

/// The loaded hook tables, stubbed by default.
pub struct PluginSet {
    idplatform: Box<dyn IdPlatform>,
    platform_plugin: Box<dyn PlatformPlugin>,
    user_plugin: Box<dyn UserPlugin>,
    /// Validation fault messages already printed, so a broken plugin does
    /// not flood the output once per test.
    seen_faults: Mutex<HashSet<String>>,
}

impl Default for PluginSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginSet {
    pub fn new() -> Self {
        Self {
            idplatform: Box::new(StubPlugins),
            platform_plugin: Box::new(StubPlugins),
            user_plugin: Box::new(StubPlugins),
            seen_faults: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_idplatform(mut self, hook: Box<dyn IdPlatform>) -> Self {
        self.idplatform = hook;
        self
    }

    pub fn with_platform_plugin(mut self, hook: Box<dyn PlatformPlugin>) -> Self {
        self.platform_plugin = hook;
        self
    }

    pub fn with_user_plugin(mut self, hook: Box<dyn UserPlugin>) -> Self {
        self.user_plugin = hook;
        self
    }

    pub fn idplatform(&self) -> &dyn IdPlatform {
        self.idplatform.as_ref()
    }

    pub fn initialize_platform(&self, platcfg: &mut PlatformConfig) {
        self.platform_plugin.initialize(platcfg);
    }

    /// Runs user validation for one test. A panicking plugin counts as a
    /// failed validation; its message is logged once per unique text.
    pub fn validate_test(&self, specs: &ValidateSpecs) -> Option<String> {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.user_plugin.validate_test(specs)
        }));

        match outcome {
            Ok(rtn) => rtn,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "user plugin panicked".to_string());
                let mut seen = self.seen_faults.lock().unwrap_or_else(|e| e.into_inner());
                if seen.insert(msg.clone()) {
                    warn!("user plugin validation fault: {}", msg);
                }
                Some(msg)
            }
        }
    }
}

impl std::fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSet").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectSlow;

    impl UserPlugin for RejectSlow {
        fn validate_test(&self, specs: &ValidateSpecs) -> Option<String> {
            specs
                .keywords
                .iter()
                .any(|k| k == "slow")
                .then(|| "slow tests disabled here".to_string())
        }
    }

    #[test]
    fn stub_plugins_accept_everything() {
        let plugins = PluginSet::new();
        assert!(plugins.validate_test(&ValidateSpecs::default()).is_none());
        assert!(plugins.idplatform().platform(&PluginOptions::default()).is_none());
    }

    #[test]
    fn user_plugin_can_veto() {
        let plugins = PluginSet::new().with_user_plugin(Box::new(RejectSlow));

        let ok = ValidateSpecs {
            keywords: vec!["fast".into()],
            ..Default::default()
        };
        assert!(plugins.validate_test(&ok).is_none());

        let slow = ValidateSpecs {
            keywords: vec!["slow".into()],
            ..Default::default()
        };
        assert_eq!(
            plugins.validate_test(&slow).as_deref(),
            Some("slow tests disabled here")
        );
    }

    struct Panicky;

    impl UserPlugin for Panicky {
        fn validate_test(&self, _specs: &ValidateSpecs) -> Option<String> {
            panic!("boom");
        }
    }

    #[test]
    fn panicking_plugin_fails_validation() {
        let plugins = PluginSet::new().with_user_plugin(Box::new(Panicky));
        let out = plugins.validate_test(&ValidateSpecs::default());
        assert_eq!(out.as_deref(), Some("boom"));
        // a second call is still a veto, silently deduplicated
        let out = plugins.validate_test(&ValidateSpecs::default());
        assert!(out.is_some());
    }
}
