use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::types::{ServiceStatus, ServiceSummary};

/// Enumerates and summarizes systemd service units by shelling out to
/// systemctl. Only constructed on Linux hosts that have it.
pub struct SystemdManager;

impl SystemdManager {
    pub fn new() -> Option<Self> {
        if !cfg!(target_os = "linux") || !crate::agent::tool_in_path("systemctl") {
            debug!("systemctl not available — service monitoring disabled");
            return None;
        }
        Some(Self)
    }

    /// All service units plus the aggregate counters.
    pub async fn summary(&self) -> Result<(Vec<ServiceStatus>, ServiceSummary)> {
        let output = tokio::process::Command::new("systemctl")
            .args([
                "list-units",
                "--type=service",
                "--all",
                "--no-pager",
                "--output=json",
            ])
            .output()
            .await
            .context("Failed to run systemctl list-units")?;
        if !output.status.success() {
            bail!("systemctl list-units exited with {}", output.status);
        }
        let services = parse_unit_list(&String::from_utf8_lossy(&output.stdout))?;
        let summary = summarize(&services);
        Ok((services, summary))
    }

    /// Detailed state for one unit name (load/active/sub/description).
    pub async fn service_detail(&self, name: &str) -> Result<ServiceStatus> {
        let unit = normalize_unit_name(name);
        let output = tokio::process::Command::new("systemctl")
            .args([
                "show",
                &unit,
                "--property=LoadState,ActiveState,SubState,Description",
                "--no-pager",
            ])
            .output()
            .await
            .context("Failed to run systemctl show")?;
        if !output.status.success() {
            bail!("systemctl show {unit} exited with {}", output.status);
        }
        parse_show_output(&unit, &String::from_utf8_lossy(&output.stdout))
    }
}

#[derive(Debug, Deserialize)]
struct UnitRow {
    unit: String,
    load: String,
    active: String,
    sub: String,
    #[serde(default)]
    description: String,
}

fn parse_unit_list(json: &str) -> Result<Vec<ServiceStatus>> {
    let rows: Vec<UnitRow> =
        serde_json::from_str(json).context("Unexpected systemctl list-units output")?;
    Ok(rows
        .into_iter()
        .map(|row| ServiceStatus {
            name: row
                .unit
                .strip_suffix(".service")
                .unwrap_or(&row.unit)
                .to_string(),
            load_state: row.load,
            active_state: row.active,
            sub_state: row.sub,
            description: row.description,
        })
        .collect())
}

pub fn summarize(services: &[ServiceStatus]) -> ServiceSummary {
    ServiceSummary {
        total: services.len() as u64,
        failed: services
            .iter()
            .filter(|s| s.active_state == "failed")
            .count() as u64,
    }
}

/// `systemctl show` emits KEY=VALUE lines.
fn parse_show_output(unit: &str, text: &str) -> Result<ServiceStatus> {
    let mut status = ServiceStatus {
        name: unit
            .strip_suffix(".service")
            .unwrap_or(unit)
            .to_string(),
        ..Default::default()
    };
    let mut any = false;
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        any = true;
        match key {
            "LoadState" => status.load_state = value.to_string(),
            "ActiveState" => status.active_state = value.to_string(),
            "SubState" => status.sub_state = value.to_string(),
            "Description" => status.description = value.to_string(),
            _ => {}
        }
    }
    if !any {
        bail!("No properties in systemctl show output for {unit}");
    }
    Ok(status)
}

fn normalize_unit_name(name: &str) -> String {
    if name.ends_with(".service") {
        name.to_string()
    } else {
        format!("{name}.service")
    }
}
