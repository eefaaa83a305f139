//! Launcher bundles - Small `.app` shims that start the original application
//! with an instance's isolated environment
//!
//! The original bundle is never copied or modified; the shim only exports the
//! resolved environment and execs the real binary in place, so the original
//! code signature stays intact. Only the shim itself gets an ad-hoc signature.

mod icon;
mod plist;
mod script;

pub use icon::{encode_icns, install_icon, IconSource};
pub use plist::ShimDescriptor;
pub use script::{is_valid_env_key, render_launch_script};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::{AppInstance, Application, LaunchEnvironment};
use crate::error::{InstanceError, Result};
use crate::platform::ShellIntegration;

/// Icon file name inside `Contents/Resources`
pub const ICON_FILE: &str = "AppIcon.icns";

/// File in the instance's data path the launch script records its PID in
pub const PID_FILE: &str = ".instance.pid";

/// Outcome of writing a shim
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShimReport {
    pub path: PathBuf,
    pub executable: PathBuf,
    pub icon: Option<IconSource>,
    pub signed: bool,
    pub registered: bool,
}

/// Writes, updates and removes launcher bundles
pub struct ShimGenerator {
    shell: Arc<dyn ShellIntegration>,
    bundle_prefix: String,
    sign: bool,
    register: bool,
    /// Serializes bundle writes
    lock: Mutex<()>,
}

impl ShimGenerator {
    pub fn new(
        shell: Arc<dyn ShellIntegration>,
        bundle_prefix: impl Into<String>,
        sign: bool,
        register: bool,
    ) -> Self {
        Self {
            shell,
            bundle_prefix: bundle_prefix.into(),
            sign,
            register,
            lock: Mutex::new(()),
        }
    }

    /// File name of the shim's script, derived from the instance name
    pub fn executable_name(instance_name: &str) -> String {
        let name: String = instance_name
            .trim()
            .chars()
            .filter_map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    Some(c)
                } else if c.is_whitespace() {
                    Some('-')
                } else {
                    None
                }
            })
            .collect();
        if name.is_empty() {
            "Instance".to_string()
        } else {
            name
        }
    }

    /// Path of the launch script inside a shim bundle
    pub fn executable_path(shim_path: &Path, instance_name: &str) -> PathBuf {
        shim_path
            .join("Contents")
            .join("MacOS")
            .join(Self::executable_name(instance_name))
    }

    /// Where a launched shim reports the application's PID
    pub fn pid_file(instance: &AppInstance) -> PathBuf {
        instance.data_path.join(PID_FILE)
    }

    /// Write the shim for `instance`. Safe to call when it already exists:
    /// descriptor, script and icon are recreated in place.
    pub fn generate(
        &self,
        instance: &AppInstance,
        app: &Application,
        launch: &LaunchEnvironment,
    ) -> Result<ShimReport> {
        let _guard = self
            .lock
            .lock()
            .map_err(|e| InstanceError::Environment(format!("Shim lock poisoned: {}", e)))?;

        let contents = instance.shim_path.join("Contents");
        let macos = contents.join("MacOS");
        let resources = contents.join("Resources");

        // Drop stale launch scripts left by an earlier name
        if macos.exists() {
            std::fs::remove_dir_all(&macos)
                .map_err(|e| InstanceError::environment("Failed to clear", &macos, e))?;
        }
        for dir in [&macos, &resources] {
            std::fs::create_dir_all(dir)
                .map_err(|e| InstanceError::environment("Failed to create directory", dir, e))?;
        }

        let executable_name = Self::executable_name(&instance.name);
        let descriptor = ShimDescriptor {
            bundle_id: instance.shim_bundle_id(&self.bundle_prefix),
            display_name: instance.name.clone(),
            executable: executable_name.clone(),
            version: crate::APP_VERSION.to_string(),
            instance_id: instance.id.to_string(),
            original_bundle_id: app.bundle_id.clone(),
            original_executable: app.executable_name().to_string(),
            target_app_path: app.bundle_path.display().to_string(),
            created_at: instance.created_at,
        };
        write_file(&contents.join("Info.plist"), descriptor.render().as_bytes())?;
        write_file(&contents.join("PkgInfo"), b"APPL????")?;

        let script = render_launch_script(
            &instance.name,
            &instance.id.to_string(),
            &app.executable_path,
            &launch.environment,
            &launch.arguments,
            &Self::pid_file(instance),
        );
        let executable = macos.join(&executable_name);
        write_file(&executable, script.as_bytes())?;
        make_executable(&executable)?;

        let icon = icon::resolve_icon(
            instance.icon_path.as_deref(),
            app,
            &resources.join(ICON_FILE),
        );

        let signed = self.sign && self.shell.sign(&instance.shim_path);
        if self.sign && !signed {
            warn!(
                "Signing failed for {:?}; the launcher may still open unsigned",
                instance.shim_path
            );
        }

        let registered = self.register && self.shell.register(&instance.shim_path);
        if self.register && !registered {
            debug!("Shell registration skipped for {:?}", instance.shim_path);
        }

        info!(
            "Wrote launcher {:?} for instance {}",
            instance.shim_path, instance.id
        );
        Ok(ShimReport {
            path: instance.shim_path.clone(),
            executable,
            icon,
            signed,
            registered,
        })
    }

    /// Delete a shim bundle. Missing bundles are not an error.
    pub fn remove(&self, shim_path: &Path) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|e| InstanceError::Environment(format!("Shim lock poisoned: {}", e)))?;

        if shim_path.symlink_metadata().is_err() {
            return Ok(());
        }
        std::fs::remove_dir_all(shim_path)
            .map_err(|e| InstanceError::environment("Failed to remove", shim_path, e))?;
        info!("Removed launcher {:?}", shim_path);
        Ok(())
    }

    /// Whether the shim for `instance` is present and launchable
    pub fn exists(&self, instance: &AppInstance) -> bool {
        Self::executable_path(&instance.shim_path, &instance.name).is_file()
    }

    pub fn reveal(&self, path: &Path) -> Result<()> {
        self.shell.reveal(path)
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).map_err(|e| InstanceError::environment("Failed to write", path, e))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| InstanceError::environment("Failed to mark executable", path, e))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::application::tests::fake_bundle;
    use crate::core::{parse_plist_strings, IsolationResolver};
    use crate::platform::fake::FakeShell;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        app: Application,
        instance: AppInstance,
        shell: Arc<FakeShell>,
    }

    fn fixture(sign_result: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let bundle = fake_bundle(dir.path(), "Chat", "com.example.chat");
        let app = Application::inspect(&bundle).unwrap();
        let instance = AppInstance::new(
            "Work Chat",
            &app,
            &dir.path().join("instances"),
            dir.path().join("shims").join("Work Chat.app"),
            Default::default(),
        );
        Fixture {
            _dir: dir,
            app,
            instance,
            shell: Arc::new(FakeShell {
                sign_result,
                ..Default::default()
            }),
        }
    }

    fn generator(shell: &Arc<FakeShell>) -> ShimGenerator {
        ShimGenerator::new(shell.clone(), "com.multiinstance.instance", true, true)
    }

    #[test]
    fn test_generate_layout() {
        let f = fixture(true);
        let launch = IsolationResolver::default().resolve(&f.instance);
        let report = generator(&f.shell)
            .generate(&f.instance, &f.app, &launch)
            .unwrap();

        let contents = f.instance.shim_path.join("Contents");
        let info = parse_plist_strings(&std::fs::read_to_string(contents.join("Info.plist")).unwrap());
        assert_eq!(info["CFBundleExecutable"], "Work-Chat");
        assert_eq!(
            info["CFBundleIdentifier"],
            format!("com.multiinstance.instance.{}", f.instance.id.0.simple())
        );
        assert_ne!(info["CFBundleIdentifier"], f.app.bundle_id);
        assert_eq!(info["MIInstanceID"], f.instance.id.to_string());
        assert_eq!(info["MIOriginalBundleID"], "com.example.chat");
        assert_eq!(info["MIOriginalExecutable"], "Chat");

        assert_eq!(report.executable, contents.join("MacOS").join("Work-Chat"));
        let script = std::fs::read_to_string(&report.executable).unwrap();
        assert!(script.contains(&format!(
            "exec {}",
            shell_words::quote(&f.app.executable_path.display().to_string())
        )));
        assert!(script.contains("export HOME="));
        assert!(script.contains(&format!(
            "echo $$ > {}",
            shell_words::quote(&ShimGenerator::pid_file(&f.instance).display().to_string())
        )));
        assert!(script.trim_end().ends_with("\"$@\""));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&report.executable).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }

        assert!(report.signed);
        assert!(report.registered);
        assert_eq!(f.shell.signed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_original_executable_untouched() {
        let f = fixture(true);
        let before = std::fs::read(&f.app.executable_path).unwrap();
        let launch = IsolationResolver::default().resolve(&f.instance);
        generator(&f.shell).generate(&f.instance, &f.app, &launch).unwrap();
        assert_eq!(std::fs::read(&f.app.executable_path).unwrap(), before);
    }

    #[test]
    fn test_signing_failure_is_not_fatal() {
        let f = fixture(false);
        let launch = IsolationResolver::default().resolve(&f.instance);
        let report = generator(&f.shell)
            .generate(&f.instance, &f.app, &launch)
            .unwrap();
        assert!(!report.signed);
        assert!(report.executable.is_file());
    }

    #[test]
    fn test_regenerate_is_idempotent() {
        let f = fixture(true);
        let shim = generator(&f.shell);
        let launch = IsolationResolver::default().resolve(&f.instance);
        shim.generate(&f.instance, &f.app, &launch).unwrap();
        let first = std::fs::read_to_string(f.instance.shim_path.join("Contents/Info.plist")).unwrap();
        shim.generate(&f.instance, &f.app, &launch).unwrap();
        let second = std::fs::read_to_string(f.instance.shim_path.join("Contents/Info.plist")).unwrap();
        assert_eq!(first, second);
        assert!(shim.exists(&f.instance));

        let entries = std::fs::read_dir(f.instance.shim_path.join("Contents/MacOS"))
            .unwrap()
            .count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_custom_icon_is_used() {
        let mut f = fixture(true);
        let icon = f.instance.shim_path.parent().unwrap().join("custom.icns");
        std::fs::create_dir_all(icon.parent().unwrap()).unwrap();
        std::fs::write(&icon, b"custom-icns").unwrap();
        f.instance.icon_path = Some(icon);

        let launch = IsolationResolver::default().resolve(&f.instance);
        let report = generator(&f.shell).generate(&f.instance, &f.app, &launch).unwrap();
        assert_eq!(report.icon, Some(IconSource::Custom));
        assert_eq!(
            std::fs::read(f.instance.shim_path.join("Contents/Resources").join(ICON_FILE)).unwrap(),
            b"custom-icns"
        );
    }

    #[test]
    fn test_original_icon_fallback() {
        let f = fixture(true);
        std::fs::write(
            f.app.bundle_path.join("Contents/Resources/app.icns"),
            b"original-icns",
        )
        .unwrap();
        let launch = IsolationResolver::default().resolve(&f.instance);
        let report = generator(&f.shell).generate(&f.instance, &f.app, &launch).unwrap();
        assert_eq!(report.icon, Some(IconSource::Original));
    }

    #[test]
    fn test_remove() {
        let f = fixture(true);
        let shim = generator(&f.shell);
        let launch = IsolationResolver::default().resolve(&f.instance);
        shim.generate(&f.instance, &f.app, &launch).unwrap();
        shim.remove(&f.instance.shim_path).unwrap();
        assert!(!f.instance.shim_path.exists());
        assert!(f.app.executable_path.exists());
        shim.remove(&f.instance.shim_path).unwrap();
    }
}
