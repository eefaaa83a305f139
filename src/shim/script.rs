//! Launch script rendering for launcher bundles

use std::collections::BTreeMap;
use std::path::Path;

use tracing::warn;

/// Shell script that exports the environment and execs the original binary,
/// forwarding any caller arguments. The script's PID is written to `pid_file`
/// first; `exec` keeps that PID for the application.
pub fn render_launch_script(
    instance_name: &str,
    instance_id: &str,
    executable: &Path,
    environment: &BTreeMap<String, String>,
    arguments: &[String],
    pid_file: &Path,
) -> String {
    let mut script = String::from("#!/bin/bash\n");
    script.push_str(&format!(
        "# Launcher for instance {} ({})\n",
        single_line(instance_name),
        instance_id
    ));

    for (key, value) in environment {
        if !is_valid_env_key(key) {
            warn!("Skipping environment variable with invalid name: {:?}", key);
            continue;
        }
        script.push_str(&format!("export {}={}\n", key, shell_words::quote(value)));
    }

    script.push_str(&format!(
        "echo $$ > {}\n",
        shell_words::quote(&pid_file.display().to_string())
    ));

    let mut exec_line = format!(
        "exec {}",
        shell_words::quote(&executable.display().to_string())
    );
    for arg in arguments {
        exec_line.push(' ');
        exec_line.push_str(&shell_words::quote(arg));
    }
    exec_line.push_str(" \"$@\"\n");
    script.push_str(&exec_line);
    script
}

/// POSIX shell variable name
pub fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn single_line(s: &str) -> String {
    s.replace(['\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_env_key_validation() {
        assert!(is_valid_env_key("HOME"));
        assert!(is_valid_env_key("_X1"));
        assert!(!is_valid_env_key("1X"));
        assert!(!is_valid_env_key("A-B"));
        assert!(!is_valid_env_key(""));
    }

    #[test]
    fn test_script_quotes_and_forwards() {
        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), "/data/my instance".to_string());
        env.insert("BAD-KEY".to_string(), "x".to_string());
        let script = render_launch_script(
            "Work\nInjected",
            "id-1",
            &PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            &env,
            &["--user-data-dir=/data/my instance".to_string()],
            Path::new("/data/my instance/.instance.pid"),
        );

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("# Launcher for instance Work Injected (id-1)\n"));
        assert!(script.contains("export HOME='/data/my instance'\n"));
        assert!(!script.contains("BAD-KEY"));
        assert!(script.contains("echo $$ > '/data/my instance/.instance.pid'\nexec "));
        assert!(script.ends_with(
            "exec '/Applications/Google Chrome.app/Contents/MacOS/Google Chrome' '--user-data-dir=/data/my instance' \"$@\"\n"
        ));
    }
}
