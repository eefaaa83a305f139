//! Application classification - Maps a bundle to an isolation strategy

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Bundle identifier namespace reserved for the OS vendor
const SYSTEM_PREFIX: &str = "com.apple.";

/// Files whose presence means the bundle came from the App Store or carries a provisioning profile
const SANDBOX_MARKERS: &[&str] = &[
    "Contents/_MASReceipt/receipt",
    "Contents/embedded.provisionprofile",
];

const CHROMIUM_IDS: &[&str] = &[
    "com.google.Chrome",
    "org.chromium.Chromium",
    "com.brave.Browser",
    "com.microsoft.edgemac",
    "com.vivaldi.Vivaldi",
    "com.operasoftware.Opera",
    "company.thebrowser.Browser",
    "com.naver.Whale",
    "ru.yandex.desktop.yandex-browser",
];

const FIREFOX_IDS: &[&str] = &[
    "org.mozilla.firefox",
    "org.mozilla.firefoxdeveloperedition",
    "org.mozilla.nightly",
    "net.waterfox.waterfox",
    "io.gitlab.librewolf-community",
    "org.torproject.torbrowser",
    "app.zen-browser.zen",
];

const TODESKTOP_IDS: &[&str] = &["com.todesktop."];

/// Runtime markers shipped inside desktop-packager bundles
const TODESKTOP_MARKERS: &[&str] = &[
    "Contents/Frameworks/ToDesktop Helper.app",
    "Contents/Resources/todesktop-runtime-config.json",
];

const ELECTRON_MARKERS: &[&str] = &["Contents/Frameworks/Electron Framework.framework"];

const CHROMIUM_MARKERS: &[&str] = &[
    "Contents/Frameworks/Chromium Framework.framework",
    "Contents/Frameworks/Google Chrome Framework.framework",
    "Contents/Frameworks/Brave Browser Framework.framework",
    "Contents/Frameworks/Microsoft Edge Framework.framework",
];

/// Family an application belongs to, which decides how it is isolated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AppType {
    Chromium,
    Firefox,
    Electron,
    ToDesktop,
    Generic,
    Sandboxed,
    System,
}

/// How the per-instance data location is communicated to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IsolationMethod {
    /// `--user-data-dir=<path>`
    UserDataDir,
    /// `-profile <path>`
    Profile,
    /// `HOME` and friends point into the container
    HomeRedirection,
    None,
}

/// Advisory rating of how reliably a type can be isolated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompatibilityLevel {
    Full,
    Partial,
    Unsupported,
}

impl AppType {
    pub fn isolation_method(&self) -> IsolationMethod {
        match self {
            Self::Chromium | Self::ToDesktop => IsolationMethod::UserDataDir,
            Self::Firefox => IsolationMethod::Profile,
            Self::Electron | Self::Generic => IsolationMethod::HomeRedirection,
            Self::Sandboxed | Self::System => IsolationMethod::None,
        }
    }

    pub fn compatibility(&self) -> CompatibilityLevel {
        match self {
            Self::Chromium | Self::Firefox | Self::Electron => CompatibilityLevel::Full,
            Self::ToDesktop | Self::Generic => CompatibilityLevel::Partial,
            Self::Sandboxed | Self::System => CompatibilityLevel::Unsupported,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Chromium => "Chromium",
            Self::Firefox => "Firefox",
            Self::Electron => "Electron",
            Self::ToDesktop => "ToDesktop",
            Self::Generic => "Generic",
            Self::Sandboxed => "Sandboxed",
            Self::System => "System",
        }
    }
}

impl IsolationMethod {
    pub fn label(&self) -> &'static str {
        match self {
            Self::UserDataDir => "user-data-dir",
            Self::Profile => "profile",
            Self::HomeRedirection => "home-redirection",
            Self::None => "none",
        }
    }
}

impl std::str::FromStr for IsolationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user-data-dir" | "userDataDir" => Ok(Self::UserDataDir),
            "profile" => Ok(Self::Profile),
            "home-redirection" | "homeRedirection" | "home" => Ok(Self::HomeRedirection),
            "none" => Ok(Self::None),
            other => Err(format!("unknown isolation method '{}'", other)),
        }
    }
}

/// Whether the bundle carries an App Store receipt or provisioning profile
pub fn is_sandboxed_bundle(bundle_path: &Path) -> bool {
    SANDBOX_MARKERS
        .iter()
        .any(|marker| bundle_path.join(marker).exists())
}

/// Classify a bundle. Identifier tables are consulted before bundle content,
/// and the desktop-packager probe runs before the Electron probe.
pub fn classify(bundle_id: &str, bundle_path: &Path, sandboxed: bool) -> AppType {
    let app_type = if bundle_id.starts_with(SYSTEM_PREFIX) {
        AppType::System
    } else if sandboxed {
        AppType::Sandboxed
    } else if let Some(known) = classify_by_identifier(bundle_id) {
        known
    } else if has_any(bundle_path, TODESKTOP_MARKERS) {
        AppType::ToDesktop
    } else if has_any(bundle_path, ELECTRON_MARKERS) {
        AppType::Electron
    } else if has_any(bundle_path, CHROMIUM_MARKERS) {
        AppType::Chromium
    } else {
        AppType::Generic
    };

    debug!("Classified {} as {:?}", bundle_id, app_type);
    app_type
}

fn classify_by_identifier(bundle_id: &str) -> Option<AppType> {
    let matches = |table: &[&str]| {
        table
            .iter()
            .any(|known| bundle_id == *known || bundle_id.starts_with(known))
    };

    if matches(CHROMIUM_IDS) {
        Some(AppType::Chromium)
    } else if matches(FIREFOX_IDS) {
        Some(AppType::Firefox)
    } else if matches(TODESKTOP_IDS) {
        Some(AppType::ToDesktop)
    } else {
        None
    }
}

fn has_any(bundle_path: &Path, markers: &[&str]) -> bool {
    markers.iter().any(|marker| bundle_path.join(marker).exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bundle_with(markers: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for marker in markers {
            let path = dir.path().join(marker);
            if marker.ends_with(".json") || marker.ends_with("receipt") {
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(&path, b"").unwrap();
            } else {
                std::fs::create_dir_all(&path).unwrap();
            }
        }
        dir
    }

    #[test]
    fn test_system_prefix_wins() {
        let bundle = bundle_with(&["Contents/Frameworks/Electron Framework.framework"]);
        assert_eq!(
            classify("com.apple.Safari", bundle.path(), true),
            AppType::System
        );
    }

    #[test]
    fn test_sandbox_receipt_detected() {
        let bundle = bundle_with(&["Contents/_MASReceipt/receipt"]);
        assert!(is_sandboxed_bundle(bundle.path()));
        assert_eq!(
            classify("com.example.Store", bundle.path(), true),
            AppType::Sandboxed
        );
    }

    #[test]
    fn test_identifier_tables() {
        let bundle = bundle_with(&[]);
        assert_eq!(
            classify("com.google.Chrome.canary", bundle.path(), false),
            AppType::Chromium
        );
        assert_eq!(
            classify("org.mozilla.firefox", bundle.path(), false),
            AppType::Firefox
        );
        assert_eq!(
            classify("com.todesktop.230313mzl4w4u92", bundle.path(), false),
            AppType::ToDesktop
        );
    }

    #[test]
    fn test_identifier_beats_content_probe() {
        let bundle = bundle_with(&["Contents/Frameworks/Electron Framework.framework"]);
        assert_eq!(
            classify("com.brave.Browser", bundle.path(), false),
            AppType::Chromium
        );
    }

    #[test]
    fn test_electron_probe_for_unknown_identifier() {
        let bundle = bundle_with(&["Contents/Frameworks/Electron Framework.framework"]);
        let app_type = classify("com.example.chat", bundle.path(), false);
        assert_eq!(app_type, AppType::Electron);
        assert_eq!(app_type.isolation_method(), IsolationMethod::HomeRedirection);
    }

    #[test]
    fn test_todesktop_probed_before_electron() {
        let bundle = bundle_with(&[
            "Contents/Frameworks/Electron Framework.framework",
            "Contents/Frameworks/ToDesktop Helper.app",
        ]);
        assert_eq!(
            classify("com.example.packaged", bundle.path(), false),
            AppType::ToDesktop
        );
    }

    #[test]
    fn test_chromium_framework_probe_and_default() {
        let chromium = bundle_with(&["Contents/Frameworks/Chromium Framework.framework"]);
        assert_eq!(
            classify("com.example.browser", chromium.path(), false),
            AppType::Chromium
        );

        let plain = bundle_with(&[]);
        assert_eq!(
            classify("com.example.editor", plain.path(), false),
            AppType::Generic
        );
    }

    #[test]
    fn test_unsupported_types_never_isolate() {
        for app_type in [AppType::Sandboxed, AppType::System] {
            assert_eq!(app_type.isolation_method(), IsolationMethod::None);
            assert_eq!(app_type.compatibility(), CompatibilityLevel::Unsupported);
        }
    }

    #[test]
    fn test_isolation_method_parse() {
        assert_eq!(
            "user-data-dir".parse::<IsolationMethod>(),
            Ok(IsolationMethod::UserDataDir)
        );
        assert!("bogus".parse::<IsolationMethod>().is_err());
    }
}
