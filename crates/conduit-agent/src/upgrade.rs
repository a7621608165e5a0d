use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{info, warn};

use crate::{api::PanelClient, config::AgentRole};

/// Artifact architecture tag for this build.
pub fn arch_tag() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "armv7",
        _ => "amd64",
    }
}

fn install_root() -> PathBuf {
    std::env::var("CONDUIT_INSTALL_DIR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/conduit"))
}

pub fn install_target(role: AgentRole) -> PathBuf {
    install_root().join(role.service_name())
}

fn version_sidecar(target: &Path) -> PathBuf {
    let mut p = target.as_os_str().to_owned();
    p.push(".version");
    PathBuf::from(p)
}

/// A sidecar `.version` file records what was last installed; a match
/// with the expected version skips the download.
pub fn needs_install(sidecar: &Path, expected: Option<&str>) -> bool {
    let Some(expected) = expected.filter(|v| !v.is_empty()) else {
        return true;
    };
    match std::fs::read_to_string(sidecar) {
        Ok(recorded) => recorded.trim() != expected,
        Err(_) => true,
    }
}

async fn download_binary(client: &PanelClient, role: AgentRole, target: &Path) -> anyhow::Result<()> {
    let url = client.artifact_url(role, arch_tag());
    let staging = target.with_extension("new");
    client
        .download_to(&url, &staging)
        .await
        .with_context(|| format!("fetch {url}"))?;

    // Atomic swap: the running binary is never half-written.
    tokio::fs::rename(&staging, target)
        .await
        .with_context(|| format!("install {}", target.display()))?;

    let mut perms = tokio::fs::metadata(target).await?.permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    tokio::fs::set_permissions(target, perms).await?;
    Ok(())
}

async fn try_restart_service(name: &str) -> bool {
    for argv in [
        vec!["systemctl", "daemon-reload"],
        vec!["systemctl", "restart", name],
    ] {
        let ok = tokio::process::Command::new(argv[0])
            .args(&argv[1..])
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        if argv[1] == "restart" && ok {
            return true;
        }
    }
    tokio::process::Command::new("service")
        .args([name, "restart"])
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

fn systemd_unit(name: &str, exec_path: &Path) -> String {
    format!(
        "[Unit]\n\
         Description={name}\n\
         After=network-online.target\n\
         \n\
         [Service]\n\
         ExecStart={}\n\
         Restart=always\n\
         RestartSec=3\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        exec_path.display()
    )
}

/// Register a unit for the binary so it survives reboots. Failure is
/// tolerated on systemd-less hosts; the caller falls back to a detached
/// spawn.
async fn ensure_systemd_unit(name: &str, exec_path: &Path) -> bool {
    let unit_path = PathBuf::from(format!("/etc/systemd/system/{name}.service"));
    if tokio::fs::write(&unit_path, systemd_unit(name, exec_path))
        .await
        .is_err()
    {
        return false;
    }
    for argv in [
        ["systemctl", "daemon-reload", ""],
        ["systemctl", "enable", name],
    ] {
        let args: Vec<&str> = argv.iter().filter(|a| !a.is_empty()).copied().collect();
        let _ = tokio::process::Command::new(args[0])
            .args(&args[1..])
            .status()
            .await;
    }
    true
}

/// Replace the running process with the freshly installed binary.
/// Preference order: systemd restart of our own service, in-place exec,
/// detached respawn. Does not return except through process exit.
async fn takeover(role: AgentRole, target: &Path) {
    let name = role.service_name();
    if try_restart_service(name).await {
        // systemd is about to kill us; wait for it rather than racing
        // the restart with a second copy.
        info!(service = name, "restart requested, waiting for supervisor");
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        std::process::exit(0);
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let err = std::os::unix::process::CommandExt::exec(
        std::process::Command::new(target).args(&args),
    );
    warn!(error = %err, "exec replacement failed, spawning detached copy");

    match std::process::Command::new(target).args(&args).spawn() {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            warn!(error = %e, "detached spawn failed, keeping current process");
            std::process::exit(1);
        }
    }
}

/// Full self-upgrade: download our own role's artifact, swap it in, and
/// hand control to the new binary. Any failure before the swap leaves
/// the running installation untouched.
pub async fn self_upgrade(client: &PanelClient, role: AgentRole) -> anyhow::Result<()> {
    let target = install_target(role);
    info!(role = role.as_str(), target = %target.display(), "self-upgrade starting");
    download_binary(client, role, &target).await?;
    if let Some(to) = client
        .expected_versions()
        .await
        .ok()
        .map(|v| match role {
            AgentRole::Agent1 => v.agent,
            AgentRole::Agent2 => v.agent2,
        })
        .filter(|v| !v.is_empty())
    {
        let _ = tokio::fs::write(version_sidecar(&target), &to).await;
    }
    takeover(role, &target).await;
    Ok(())
}

/// Install (or update) a role's binary and make sure it is running,
/// without touching the current process. Used for the counterpart role
/// and for coordinator-pushed install commands.
pub async fn ensure_role_installed(
    client: &PanelClient,
    role: AgentRole,
    expected: Option<&str>,
) -> anyhow::Result<()> {
    let target = install_target(role);
    let sidecar = version_sidecar(&target);
    if target.exists() && !needs_install(&sidecar, expected) {
        return Ok(());
    }

    info!(role = role.as_str(), target = %target.display(), "installing agent binary");
    download_binary(client, role, &target).await?;
    if let Some(v) = expected.filter(|v| !v.is_empty()) {
        let _ = tokio::fs::write(&sidecar, v).await;
    }

    let name = role.service_name();
    if ensure_systemd_unit(name, &target).await && try_restart_service(name).await {
        return Ok(());
    }

    // No supervisor: leave a detached copy running.
    std::process::Command::new(&target)
        .spawn()
        .with_context(|| format!("start {}", target.display()))?;
    Ok(())
}

/// On connect, make sure the counterpart role is installed at the
/// version the coordinator expects.
pub async fn cross_check_counterpart(client: &PanelClient, my_role: AgentRole) {
    let versions = match client.expected_versions().await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "counterpart check: version fetch failed");
            return;
        }
    };
    let other = my_role.counterpart();
    let expected = match other {
        AgentRole::Agent1 => versions.agent,
        AgentRole::Agent2 => versions.agent2,
    };
    if expected.is_empty() {
        return;
    }
    if let Err(e) = ensure_role_installed(client, other, Some(&expected)).await {
        warn!(role = other.as_str(), error = %e, "counterpart install failed");
    }
}
