//! CLI-only subcommand implementations: `check`.
//!
//! `check` does not start the daemon. It verifies that the host has what
//! `serve` needs and prints a fix for anything missing.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::config::Config;

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Run `vmadmd check`. Returns `Ok(())` if all checks pass, `Err` otherwise.
pub fn run_check(config: &Config) -> Result<()> {
    println!("Checking prerequisites...\n");

    let checks = collect_checks(config);
    let all_pass = checks.iter().all(|c| c.ok);

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if !c.ok {
            if let Some(fix) = &c.fix {
                println!("    Fix: {}", fix);
            }
        }
    }

    println!();
    if all_pass {
        let config_hint = match std::env::current_exe() {
            Ok(exe) => format!("{} serve --config vmadmd.toml", exe.display()),
            Err(_) => "vmadmd serve --config vmadmd.toml".to_string(),
        };
        println!("All checks passed. Run: {}", config_hint);
        Ok(())
    } else {
        let failed = checks.iter().filter(|c| !c.ok).count();
        anyhow::bail!("{} check(s) failed", failed)
    }
}

fn collect_checks(config: &Config) -> Vec<Check> {
    let mut checks = vec![
        check_executable("zoneevent helper", &config.zones.zoneevent_binary),
        check_executable("vmadm", &config.zones.vmadm_binary),
        check_executable("zonecfg", &config.zones.zonecfg_binary),
        check_display_address(config),
    ];

    if let Some(script) = &config.reconciler.log_rotate_script {
        checks.push(check_executable("Log rotation script", script));
    }

    if config.server.http_addr.is_none() {
        checks.push(check_writable_dir("Control socket directory", &config.server.socket_path));
    }
    checks.push(check_writable_dir("Lock file directory", &config.server.lock_file));
    checks.push(check_writable_dir("Autoboot marker directory", &config.server.autoboot_marker));
    checks
}

fn check_executable(label: &'static str, path: &Path) -> Check {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.permissions().mode() & 0o111 != 0 => {
            Check::pass(label, path.display().to_string())
        }
        Ok(_) => Check::fail(
            label,
            format!("{} is not an executable file", path.display()),
            format!("chmod +x {}", path.display()),
        ),
        Err(e) => Check::fail(
            label,
            format!("{}: {}", path.display(), e),
            "Install the SmartOS VM tools or point [zones] at their location",
        ),
    }
}

fn check_display_address(config: &Config) -> Check {
    if let Some(addr) = &config.display.bind_addr {
        return Check::pass("Display address", format!("{} (configured)", addr));
    }

    let binary = &config.display.sysinfo_binary;
    let fix = "Set display.bind_addr, or make sysinfo report a NIC tagged 'admin'";
    match std::process::Command::new(binary).output() {
        Ok(out) if out.status.success() => {
            match crate::host::admin_ip(&String::from_utf8_lossy(&out.stdout)) {
                Ok(ip) => Check::pass("Display address", format!("{} (admin NIC)", ip)),
                Err(e) => Check::fail("Display address", format!("{:#}", e), fix),
            }
        }
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Check::fail(
                "Display address",
                format!("{} exited with error: {}", binary.display(), stderr.trim()),
                fix,
            )
        }
        Err(e) => Check::fail("Display address", format!("{} not found: {}", binary.display(), e), fix),
    }
}

/// Check that the directory holding `file` exists and accepts new files.
fn check_writable_dir(label: &'static str, file: &Path) -> Check {
    let parent = match file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => {
            return Check::fail(
                label,
                format!("{} has no parent directory", file.display()),
                "Use an absolute path",
            );
        }
    };

    if !parent.exists() {
        return Check::fail(
            label,
            format!("{} does not exist", parent.display()),
            format!("mkdir -p {}", parent.display()),
        );
    }

    // Check writability by attempting to open a temp file
    let probe = parent.join(".vmadmd-check");
    match std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            Check::pass(label, parent.display().to_string())
        }
        Err(e) => Check::fail(
            label,
            format!("{} is not writable: {}", parent.display(), e),
            format!("chmod u+w {} or run vmadmd as root", parent.display()),
        ),
    }
}

/// Load a config from an optional path, falling back to defaults.
pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    Config::load_or_default(config_path.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executable(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config_in(dir: &Path) -> Config {
        let mut config = Config::default();
        config.zones.zoneevent_binary = executable(dir, "zoneevent");
        config.zones.vmadm_binary = executable(dir, "vmadm");
        config.zones.zonecfg_binary = executable(dir, "zonecfg");
        config.reconciler.log_rotate_script = None;
        config.display.bind_addr = Some("127.0.0.1".into());
        config.server.socket_path = dir.join("vmadmd.http");
        config.server.lock_file = dir.join("vmadmd.lock");
        config.server.autoboot_marker = dir.join(".autoboot_vmadmd");
        config
    }

    #[test]
    fn test_all_checks_pass() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let checks = collect_checks(&config);
        assert!(checks.iter().all(|c| c.ok), "failed: {:?}", checks.iter().filter(|c| !c.ok).map(|c| &c.detail).collect::<Vec<_>>());
        run_check(&config).unwrap();
    }

    #[test]
    fn test_missing_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.zones.vmadm_binary = dir.path().join("missing");
        let checks = collect_checks(&config);
        let vmadm = checks.iter().find(|c| c.label == "vmadm").unwrap();
        assert!(!vmadm.ok);
        assert!(vmadm.fix.is_some());
        assert!(run_check(&config).is_err());
    }

    #[test]
    fn test_non_executable_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        std::fs::write(&path, "").unwrap();
        assert!(!check_executable("plain", &path).ok);
    }

    #[test]
    fn test_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let check = check_writable_dir("Lock", &dir.path().join("nope/vmadmd.lock"));
        assert!(!check.ok);
        assert!(check.fix.unwrap().starts_with("mkdir -p"));
    }

    #[test]
    fn test_tcp_listener_skips_socket_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.server.http_addr = Some("127.0.0.1:8787".into());
        config.server.socket_path = PathBuf::from("/nonexistent/dir/vmadmd.http");
        assert!(collect_checks(&config).iter().all(|c| c.ok));
    }
}
