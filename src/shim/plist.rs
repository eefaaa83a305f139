//! Info.plist rendering for launcher bundles

use chrono::{DateTime, Utc};

/// Values that can appear in a launcher descriptor
#[derive(Debug, Clone, PartialEq)]
pub enum PlistValue {
    String(String),
    Bool(bool),
}

/// Custom keys carried for traceability
pub const KEY_INSTANCE_ID: &str = "MIInstanceID";
pub const KEY_ORIGINAL_BUNDLE_ID: &str = "MIOriginalBundleID";
pub const KEY_ORIGINAL_EXECUTABLE: &str = "MIOriginalExecutable";
pub const KEY_TARGET_APP_PATH: &str = "MITargetAppPath";
pub const KEY_CREATED_AT: &str = "MICreatedAt";

/// Everything the descriptor of a launcher bundle records
#[derive(Debug, Clone)]
pub struct ShimDescriptor {
    pub bundle_id: String,
    pub display_name: String,
    pub executable: String,
    pub version: String,
    pub instance_id: String,
    pub original_bundle_id: String,
    pub original_executable: String,
    pub target_app_path: String,
    pub created_at: DateTime<Utc>,
}

impl ShimDescriptor {
    fn entries(&self) -> Vec<(&'static str, PlistValue)> {
        let s = |v: &str| PlistValue::String(v.to_string());
        vec![
            ("CFBundleDevelopmentRegion", s("en")),
            ("CFBundleDisplayName", s(&self.display_name)),
            ("CFBundleExecutable", s(&self.executable)),
            ("CFBundleIconFile", s("AppIcon")),
            ("CFBundleIdentifier", s(&self.bundle_id)),
            ("CFBundleInfoDictionaryVersion", s("6.0")),
            ("CFBundleName", s(&self.display_name)),
            ("CFBundlePackageType", s("APPL")),
            ("CFBundleShortVersionString", s(&self.version)),
            ("CFBundleVersion", s(&self.version)),
            ("LSMinimumSystemVersion", s("11.0")),
            ("NSHighResolutionCapable", PlistValue::Bool(true)),
            (KEY_INSTANCE_ID, s(&self.instance_id)),
            (KEY_ORIGINAL_BUNDLE_ID, s(&self.original_bundle_id)),
            (KEY_ORIGINAL_EXECUTABLE, s(&self.original_executable)),
            (KEY_TARGET_APP_PATH, s(&self.target_app_path)),
            (KEY_CREATED_AT, s(&self.created_at.to_rfc3339())),
        ]
    }

    /// XML property list text
    pub fn render(&self) -> String {
        let mut body = String::new();
        for (key, value) in self.entries() {
            body.push_str(&format!("    <key>{}</key>\n", escape_xml(key)));
            match value {
                PlistValue::String(v) => {
                    body.push_str(&format!("    <string>{}</string>\n", escape_xml(&v)))
                }
                PlistValue::Bool(true) => body.push_str("    <true/>\n"),
                PlistValue::Bool(false) => body.push_str("    <false/>\n"),
            }
        }

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
{}</dict>
</plist>
"#,
            body
        )
    }
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
