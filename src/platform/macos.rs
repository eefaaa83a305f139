//! macOS shell integration - LaunchServices, codesign, Finder

use std::path::Path;
use std::process::Command;

use tracing::{debug, warn};

use crate::error::{InstanceError, Result};

const LSREGISTER: &str = "/System/Library/Frameworks/CoreServices.framework/Frameworks/LaunchServices.framework/Support/lsregister";

/// Generic application icon shipped with the OS
pub const GENERIC_APP_ICON: &str =
    "/System/Library/CoreServices/CoreTypes.bundle/Contents/Resources/GenericApplicationIcon.icns";

/// Convert a binary plist to XML with plutil
pub fn convert_plist_to_xml(path: &Path) -> Result<String> {
    let output = Command::new("/usr/bin/plutil")
        .args(["-convert", "xml1", "-o", "-"])
        .arg(path)
        .output()
        .map_err(|e| InstanceError::environment("Failed to run plutil on", path, e))?;

    if !output.status.success() {
        return Err(InstanceError::InvalidInput(format!(
            "Unreadable property list {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Ad-hoc sign a bundle
pub fn sign_bundle(bundle: &Path) -> bool {
    run_quiet(
        Command::new("/usr/bin/codesign")
            .args(["--force", "--deep", "--sign", "-"])
            .arg(bundle),
        "codesign",
    )
}

/// Register a bundle with LaunchServices
pub fn register_bundle(bundle: &Path) -> bool {
    run_quiet(Command::new(LSREGISTER).arg("-f").arg(bundle), "lsregister")
}

/// Select a path in Finder
pub fn reveal(path: &Path) -> Result<()> {
    let status = Command::new("/usr/bin/open")
        .arg("-R")
        .arg(path)
        .status()
        .map_err(|e| InstanceError::environment("Failed to reveal", path, e))?;
    if status.success() {
        Ok(())
    } else {
        Err(InstanceError::Environment(format!(
            "Finder could not reveal {}",
            path.display()
        )))
    }
}

/// `open -n -W` starts a fresh copy of the bundle and stays alive until it quits
pub fn open_command(bundle: &Path) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("/usr/bin/open");
    cmd.arg("-n").arg("-W").arg(bundle);
    cmd
}

fn run_quiet(cmd: &mut Command, tool: &str) -> bool {
    match cmd.output() {
        Ok(output) if output.status.success() => {
            debug!("{} succeeded", tool);
            true
        }
        Ok(output) => {
            warn!(
                "{} failed: {}",
                tool,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            false
        }
        Err(e) => {
            warn!("Failed to run {}: {}", tool, e);
            false
        }
    }
}
