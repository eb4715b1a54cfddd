//! Polkit Integration - Privilege Checks
//!
//! Decides whether this process may upgrade the privileged update service.
//! The check goes through zbus_polkit; the orchestrator only sees the
//! [`PrivilegeAuthority`] trait.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use zbus::Connection;
use zbus_polkit::policykit1::{AuthorityProxy, CheckAuthorizationFlags, Subject};

/// Polkit action ID for installing or upgrading the update service
pub const ACTION_INSTALL_SERVICE: &str = "org.upstage.service.install";

/// Path where the polkit policy file should be installed
pub const POLICY_FILE_PATH: &str = "/usr/share/polkit-1/actions/org.upstage.policy";

/// Platform privilege questions asked before the privileged path
#[async_trait]
pub trait PrivilegeAuthority: Send + Sync {
    /// Whether the current process already runs elevated
    fn is_elevated(&self) -> bool;

    /// Whether the authority allows installing the update service
    async fn can_install_service(&self) -> bool;
}

/// The system polkit authority over D-Bus
#[derive(Debug, Default, Clone, Copy)]
pub struct PolkitAuthority;

#[async_trait]
impl PrivilegeAuthority for PolkitAuthority {
    fn is_elevated(&self) -> bool {
        is_root()
    }

    async fn can_install_service(&self) -> bool {
        match check_authorization(ACTION_INSTALL_SERVICE).await {
            Ok(authorized) => authorized,
            Err(e) => {
                tracing::warn!("Polkit check failed: {:#}", e);
                false
            }
        }
    }
}

/// Check if the current process has authorization for an action
pub async fn check_authorization(action_id: &str) -> Result<bool> {
    let connection = Connection::system()
        .await
        .context("Failed to connect to system D-Bus")?;

    let proxy = AuthorityProxy::new(&connection)
        .await
        .context("Failed to create polkit authority proxy")?;

    let subject = Subject::new_for_owner(std::process::id(), None, None)?;

    let result = proxy
        .check_authorization(
            &subject,
            action_id,
            &HashMap::new(),
            CheckAuthorizationFlags::AllowUserInteraction.into(),
            "",
        )
        .await
        .context("Failed to check authorization")?;

    Ok(result.is_authorized)
}

/// Check if we're running with root privileges
pub fn is_root() -> bool {
    #[cfg(unix)]
    {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|content| effective_uid_is_root(&content))
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

// Format: Uid: real effective saved fs
fn effective_uid_is_root(proc_status: &str) -> Option<bool> {
    proc_status
        .lines()
        .find(|line| line.starts_with("Uid:"))
        .and_then(|line| line.split_whitespace().nth(2))
        .map(|uid| uid == "0")
}

/// Polkit policy file content for the update service
///
/// Must be installed to /usr/share/polkit-1/actions/ before polkit will
/// answer for `org.upstage.service.install`.
pub fn policy_file_content() -> &'static str {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE policyconfig PUBLIC
 "-//freedesktop//DTD PolicyKit Policy Configuration 1.0//EN"
 "http://www.freedesktop.org/standards/PolicyKit/1.0/policyconfig.dtd">
<policyconfig>
  <vendor>Upstage</vendor>

  <action id="org.upstage.service.install">
    <description>Install or upgrade the update service</description>
    <message>Authentication is required to upgrade the application update service</message>
    <defaults>
      <allow_any>auth_admin</allow_any>
      <allow_inactive>auth_admin</allow_inactive>
      <allow_active>auth_admin_keep</allow_active>
    </defaults>
  </action>
</policyconfig>
"#
}

/// Install the polkit policy file (requires root)
///
/// Returns Ok(true) if installed, Ok(false) if already exists, Err on failure
pub fn install_policy_file(policy_path: &Path) -> Result<bool> {
    use std::fs;

    if policy_path.exists() {
        tracing::info!("Polkit policy file already exists at {}", policy_path.display());
        return Ok(false);
    }

    if let Some(parent) = policy_path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).context("Failed to create polkit actions directory")?;
        }
    }

    fs::write(policy_path, policy_file_content())
        .context("Failed to write polkit policy file. Are you running as root?")?;

    tracing::info!("Installed polkit policy file to {}", policy_path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_uid_parsing() {
        let root = "Name:\tupstage\nUid:\t1000\t0\t0\t0\nGid:\t1000\t1000\t1000\t1000\n";
        let user = "Uid:\t1000\t1000\t1000\t1000\n";
        assert_eq!(effective_uid_is_root(root), Some(true));
        assert_eq!(effective_uid_is_root(user), Some(false));
        assert_eq!(effective_uid_is_root("Name: x\n"), None);
    }

    #[test]
    fn test_policy_file_content() {
        assert!(policy_file_content().contains(ACTION_INSTALL_SERVICE));
        assert!(POLICY_FILE_PATH.ends_with(".policy"));
    }

    #[test]
    fn test_install_policy_file_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("actions").join("org.upstage.policy");

        assert!(install_policy_file(&path).unwrap());
        assert!(!install_policy_file(&path).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), policy_file_content());
    }
}
