//! Unix process signalling

use anyhow::Result;

fn signal(pid: u32, sig: libc::c_int, action: &str) -> Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| anyhow::anyhow!("Invalid process id: {}", pid))?;
    // SAFETY: kill(2) has no memory-safety preconditions
    let result = unsafe { libc::kill(pid, sig) };
    if result == 0 {
        Ok(())
    } else {
        anyhow::bail!(
            "Failed to {} process {}: {}",
            action,
            pid,
            std::io::Error::last_os_error()
        )
    }
}

/// Terminate a process gracefully (SIGTERM)
pub fn terminate_process(pid: u32) -> Result<()> {
    signal(pid, libc::SIGTERM, "terminate")
}

/// Force kill a process (SIGKILL)
pub fn kill_process(pid: u32) -> Result<()> {
    signal(pid, libc::SIGKILL, "kill")
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    // Signal 0 checks for existence without delivering anything
    signal(pid, 0, "liveness check").is_ok()
}
