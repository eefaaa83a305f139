//! Isolation strategy - Effective environment and arguments for a launch

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use super::app_type::IsolationMethod;
use super::instance::AppInstance;

/// Directory under the container used for `-profile`
pub const PROFILE_SUBDIR: &str = "Profiles/default";

/// Variables always pointed into the container; they win over user values
const HOME_VARIABLES: &[(&str, &str)] = &[
    ("HOME", ""),
    ("XDG_CONFIG_HOME", ".config"),
    ("XDG_CACHE_HOME", ".cache"),
    ("XDG_DATA_HOME", ".local/share"),
    ("TMPDIR", "tmp"),
];

/// Special case for a known application. Templates may use `{data}` (the
/// container path) and `{name}` (the instance name).
#[derive(Debug, Clone)]
pub struct AppOverride {
    /// Substring matched against the target bundle identifier
    pub pattern: &'static str,
    pub arguments: &'static [&'static str],
    pub environment: &'static [(&'static str, &'static str)],
}

/// Applications that need their own multi-instance flags
pub const APP_OVERRIDES: &[AppOverride] = &[
    AppOverride {
        pattern: "com.tdesktop.Telegram",
        arguments: &["-many", "-workdir", "{data}"],
        environment: &[("HOME", "{data}")],
    },
    AppOverride {
        pattern: "com.spotify.client",
        arguments: &["--mu={name}"],
        environment: &[("HOME", "{data}")],
    },
    AppOverride {
        pattern: "org.mozilla.",
        arguments: &["-no-remote", "-profile", "{data}/Profiles/default"],
        environment: &[("HOME", "{data}")],
    },
];

/// Final environment and argument list handed to the launcher
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LaunchEnvironment {
    pub environment: BTreeMap<String, String>,
    pub arguments: Vec<String>,
}

/// Resolves the effective launch environment for an instance
#[derive(Debug, Clone)]
pub struct IsolationResolver {
    overrides: Vec<AppOverride>,
}

impl Default for IsolationResolver {
    fn default() -> Self {
        Self::new(APP_OVERRIDES.to_vec())
    }
}

impl IsolationResolver {
    pub fn new(overrides: Vec<AppOverride>) -> Self {
        Self { overrides }
    }

    /// The override row matching `bundle_id`, if any
    pub fn find_override(&self, bundle_id: &str) -> Option<&AppOverride> {
        self.overrides
            .iter()
            .find(|o| bundle_id.contains(o.pattern))
    }

    pub fn resolve(&self, instance: &AppInstance) -> LaunchEnvironment {
        if let Some(row) = self.find_override(&instance.target_bundle_id) {
            debug!(
                "Using override '{}' for instance {}",
                row.pattern, instance.id
            );
            if !instance.environment.is_empty() || !instance.arguments.is_empty() {
                warn!(
                    "Instance {} has custom environment/arguments that are not applied to {}",
                    instance.id, instance.target_bundle_id
                );
            }
            return expand_override(row, instance);
        }

        let data = &instance.data_path;
        let method = instance.isolation_method();

        let mut environment = instance.environment.clone();
        for (key, sub) in HOME_VARIABLES {
            let value = join_display(data, sub);
            if let Some(previous) = environment.insert(key.to_string(), value) {
                warn!(
                    "Ignoring custom {}={} for instance {}; isolation takes precedence",
                    key, previous, instance.id
                );
            }
        }

        let mut arguments = match method {
            IsolationMethod::UserDataDir => {
                vec![format!("--user-data-dir={}", data.display())]
            }
            IsolationMethod::Profile => {
                vec!["-profile".to_string(), join_display(data, PROFILE_SUBDIR)]
            }
            IsolationMethod::HomeRedirection | IsolationMethod::None => Vec::new(),
        };
        arguments.extend(strip_isolation_arguments(&instance.arguments, method));

        LaunchEnvironment {
            environment,
            arguments,
        }
    }
}

fn expand_override(row: &AppOverride, instance: &AppInstance) -> LaunchEnvironment {
    let data = instance.data_path.display().to_string();
    let expand = |template: &str| {
        template
            .replace("{data}", &data)
            .replace("{name}", &instance.name)
    };

    LaunchEnvironment {
        environment: row
            .environment
            .iter()
            .map(|(k, v)| (k.to_string(), expand(v)))
            .collect(),
        arguments: row.arguments.iter().map(|a| expand(a)).collect(),
    }
}

/// Drop user arguments that would point the app at a different data location.
fn strip_isolation_arguments(arguments: &[String], method: IsolationMethod) -> Vec<String> {
    let mut kept = Vec::with_capacity(arguments.len());
    let mut iter = arguments.iter();
    while let Some(arg) = iter.next() {
        match method {
            IsolationMethod::UserDataDir if arg.starts_with("--user-data-dir") => {
                warn!("Dropping custom argument {}", arg);
                if arg == "--user-data-dir" {
                    iter.next();
                }
            }
            IsolationMethod::Profile if arg == "-profile" || arg == "--profile" => {
                warn!("Dropping custom argument {}", arg);
                iter.next();
            }
            _ => kept.push(arg.clone()),
        }
    }
    kept
}

fn join_display(base: &Path, sub: &str) -> String {
    if sub.is_empty() {
        base.display().to_string()
    } else {
        base.join(sub).display().to_string()
    }
}
