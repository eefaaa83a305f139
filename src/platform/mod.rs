//! Platform-specific process signalling and shell integration

#[cfg(unix)]
mod unix;

#[cfg(target_os = "macos")]
pub mod macos;

use std::path::Path;

use anyhow::Result;
#[cfg(not(target_os = "macos"))]
use tracing::debug;

#[cfg(not(target_os = "macos"))]
use crate::error::InstanceError;

/// Terminate a process gracefully
pub fn terminate_process(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        unix::terminate_process(pid)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        anyhow::bail!("Unsupported platform")
    }
}

/// Force kill a process
pub fn kill_process(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        unix::kill_process(pid)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        anyhow::bail!("Unsupported platform")
    }
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unix::is_process_running(pid)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Convert a binary property list to XML text
pub fn convert_plist_to_xml(path: &Path) -> crate::error::Result<String> {
    #[cfg(target_os = "macos")]
    {
        macos::convert_plist_to_xml(path)
    }
    #[cfg(not(target_os = "macos"))]
    {
        Err(InstanceError::InvalidInput(format!(
            "Binary property lists are not supported on this platform: {}",
            path.display()
        )))
    }
}

/// OS shell hooks the launcher bundle generator and process launcher rely on.
/// Failures are reported as `false` and treated as non-fatal by callers.
pub trait ShellIntegration: Send + Sync {
    /// Register a bundle with the OS application database
    fn register(&self, bundle: &Path) -> bool;

    /// Ad-hoc sign a bundle
    fn sign(&self, bundle: &Path) -> bool;

    /// Show a path in the file browser
    fn reveal(&self, path: &Path) -> crate::error::Result<()>;

    /// Command that opens a shim bundle through the shell. The spawned process
    /// may be a helper; the shim reports the application's own PID.
    fn open_command(&self, bundle: &Path, executable: &Path) -> tokio::process::Command;
}

/// Shell integration for the running OS
pub struct SystemShell;

impl ShellIntegration for SystemShell {
    fn register(&self, bundle: &Path) -> bool {
        #[cfg(target_os = "macos")]
        {
            macos::register_bundle(bundle)
        }
        #[cfg(not(target_os = "macos"))]
        {
            debug!("No shell registration on this platform for {:?}", bundle);
            false
        }
    }

    fn sign(&self, bundle: &Path) -> bool {
        #[cfg(target_os = "macos")]
        {
            macos::sign_bundle(bundle)
        }
        #[cfg(not(target_os = "macos"))]
        {
            debug!("No code signing on this platform for {:?}", bundle);
            false
        }
    }

    fn reveal(&self, path: &Path) -> crate::error::Result<()> {
        #[cfg(target_os = "macos")]
        {
            macos::reveal(path)
        }
        #[cfg(not(target_os = "macos"))]
        {
            let target = if path.is_dir() {
                path
            } else {
                path.parent().unwrap_or(path)
            };
            open::that(target).map_err(|e| {
                InstanceError::Environment(format!("Failed to reveal {}: {}", path.display(), e))
            })
        }
    }

    fn open_command(&self, bundle: &Path, executable: &Path) -> tokio::process::Command {
        #[cfg(target_os = "macos")]
        {
            let _ = executable;
            macos::open_command(bundle)
        }
        #[cfg(not(target_os = "macos"))]
        {
            let _ = bundle;
            tokio::process::Command::new(executable)
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use super::ShellIntegration;

    /// Records calls and runs shim scripts through a waiting helper shell
    #[derive(Default)]
    pub(crate) struct FakeShell {
        pub sign_result: bool,
        pub registered: Mutex<Vec<PathBuf>>,
        pub signed: Mutex<Vec<PathBuf>>,
        pub revealed: Mutex<Vec<PathBuf>>,
    }

    impl ShellIntegration for FakeShell {
        fn register(&self, bundle: &Path) -> bool {
            self.registered.lock().unwrap().push(bundle.to_path_buf());
            true
        }

        fn sign(&self, bundle: &Path) -> bool {
            self.signed.lock().unwrap().push(bundle.to_path_buf());
            self.sign_result
        }

        fn reveal(&self, path: &Path) -> crate::error::Result<()> {
            self.revealed.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        /// Starts the script in the background and waits, like `open -n -W`
        fn open_command(&self, _bundle: &Path, executable: &Path) -> tokio::process::Command {
            let mut cmd = tokio::process::Command::new("/bin/sh");
            cmd.arg("-c").arg(r#""$0" & wait"#).arg(executable);
            cmd
        }
    }
}
