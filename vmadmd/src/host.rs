//! Host identity: the address display listeners bind to.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::config::DisplayConfig;
use crate::store::vmadm::run_tool;

/// The part of `sysinfo` output we care about.
#[derive(Debug, Deserialize)]
struct SysInfo {
    #[serde(rename = "Network Interfaces", default)]
    network_interfaces: BTreeMap<String, Nic>,
}

#[derive(Debug, Deserialize)]
struct Nic {
    #[serde(default)]
    ip4addr: Option<String>,
    #[serde(rename = "NIC Names", default)]
    nic_names: Vec<String>,
}

/// Pick the IPv4 address of the NIC tagged `admin` from `sysinfo` JSON.
pub fn admin_ip(sysinfo_json: &str) -> Result<String> {
    let info: SysInfo = serde_json::from_str(sysinfo_json).context("failed to parse sysinfo output")?;
    for (name, nic) in &info.network_interfaces {
        if !nic.nic_names.iter().any(|n| n == "admin") {
            continue;
        }
        match nic.ip4addr.as_deref().map(str::trim) {
            Some(ip) if !ip.is_empty() => return Ok(ip.to_string()),
            _ => bail!("admin interface {} has no IPv4 address", name),
        }
    }
    bail!("sysinfo reports no admin interface")
}

/// Resolve the display bind address: the configured override, or the admin
/// IP as reported by `sysinfo`.
pub async fn resolve_display_host(config: &DisplayConfig) -> Result<String> {
    if let Some(addr) = &config.bind_addr {
        info!(addr = %addr, "using configured display address");
        return Ok(addr.clone());
    }
    let output = run_sysinfo(&config.sysinfo_binary).await?;
    let ip = admin_ip(&output)?;
    info!(addr = %ip, "display listeners bind to admin IP");
    Ok(ip)
}

async fn run_sysinfo(binary: &Path) -> Result<String> {
    run_tool(binary, &[], None)
        .await
        .with_context(|| format!("unable to determine admin IP from {}", binary.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    const SYSINFO: &str = r#"{
        "UUID": "44454c4c-5400-1034-804d-b5c04f383432",
        "Network Interfaces": {
            "e1000g0": {"MAC Address": "00:0c:29:aa:bb:cc", "ip4addr": "10.99.99.7", "Link Status": "up", "NIC Names": ["admin"]},
            "e1000g1": {"MAC Address": "00:0c:29:aa:bb:cd", "ip4addr": "", "Link Status": "up", "NIC Names": ["external"]}
        }
    }"#;

    #[test]
    fn test_admin_ip() {
        assert_eq!(admin_ip(SYSINFO).unwrap(), "10.99.99.7");
    }

    #[test]
    fn test_admin_ip_missing() {
        let err = admin_ip(r#"{"Network Interfaces": {"net0": {"ip4addr": "1.2.3.4", "NIC Names": ["external"]}}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("no admin interface"));

        let err = admin_ip(r#"{"Network Interfaces": {"net0": {"ip4addr": "", "NIC Names": ["admin"]}}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("no IPv4 address"));

        assert!(admin_ip("{}").is_err());
        assert!(admin_ip("not json").is_err());
    }

    #[tokio::test]
    async fn test_configured_address_wins() {
        let config = DisplayConfig {
            bind_addr: Some("192.168.1.10".into()),
            sysinfo_binary: PathBuf::from("/nonexistent/sysinfo"),
        };
        assert_eq!(resolve_display_host(&config).await.unwrap(), "192.168.1.10");
    }

    #[tokio::test]
    async fn test_resolves_from_sysinfo_binary() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("sysinfo");
        std::fs::write(&script, format!("#!/bin/sh\ncat <<'EOF'\n{}\nEOF\n", SYSINFO)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = DisplayConfig {
            bind_addr: None,
            sysinfo_binary: script,
        };
        assert_eq!(resolve_display_host(&config).await.unwrap(), "10.99.99.7");
    }

    #[tokio::test]
    async fn test_missing_sysinfo_is_an_error() {
        let config = DisplayConfig {
            bind_addr: None,
            sysinfo_binary: PathBuf::from("/nonexistent/sysinfo"),
        };
        assert!(resolve_display_host(&config).await.is_err());
    }
}
