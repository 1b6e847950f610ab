//! Command handlers.

use crate::simulate::{self, SimulatedBuild};
use console::style;
use cruise_scheduler::{ItemStatus, ItemType, Server, StructureConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Load and build a structure file.
pub fn load(path: &str) -> anyhow::Result<(StructureConfig, Server)> {
    let config = StructureConfig::from_file(path)?;
    let server = config.build()?;
    Ok((config, server))
}

/// Validate a structure file.
pub fn validate(path: &str) -> anyhow::Result<()> {
    let (config, server) = load(path)?;

    println!(
        "{} Structure \"{}\" is valid",
        style("✓").green(),
        server.name()
    );
    println!("  Items: {}", config.items.len());
    println!("  Roots: {}", server.roots().len());
    println!("  Projects: {}", server.project_names().join(", "));
    Ok(())
}

/// Print the tree.
pub fn tree(path: &str, json: bool) -> anyhow::Result<()> {
    let (_, server) = load(path)?;
    let status = server.status();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("{}", style(server.name()).bold());
        print!("{}", render_tree(&status));
    }
    Ok(())
}

/// Print the JSON schema of structure files.
pub fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(StructureConfig);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Run a simulation and print the admission order.
pub async fn simulate(
    path: &str,
    requests: Vec<String>,
    build_ms: u64,
    fail: Vec<String>,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let (_, server) = load(path)?;
    let executor = Arc::new(SimulatedBuild::new(Duration::from_millis(build_ms), fail));

    info!(requests = requests.len(), build_ms, "Starting simulation");
    let report = simulate::run(
        Arc::new(server),
        &requests,
        executor,
        Duration::from_secs(timeout_secs),
    )
    .await?;

    println!("{}", style("Admission order").bold());
    for (position, project) in report.admission_order.iter().enumerate() {
        println!("  {:>2}. {}", position + 1, project);
    }

    println!("{}", style("Outcomes").bold());
    for outcome in &report.outcomes {
        match (&outcome.status, &outcome.cancelled) {
            (Some(status), _) => println!("  {} {:?}", outcome.project, status),
            (None, reason) => println!(
                "  {} {} ({})",
                outcome.project,
                style("cancelled").yellow(),
                reason.as_deref().unwrap_or("timed out")
            ),
        }
    }
    Ok(())
}

/// Render status snapshots as an indented tree.
pub fn render_tree(items: &[ItemStatus]) -> String {
    let mut out = String::new();
    for (index, item) in items.iter().enumerate() {
        render_item(item, "", index + 1 == items.len(), &mut out);
    }
    out
}

fn render_item(item: &ItemStatus, prefix: &str, last: bool, out: &mut String) {
    let branch = if last { "└── " } else { "├── " };
    let counts = if item.item_type == ItemType::Project {
        String::new()
    } else {
        format!(" active={} pending={}", item.active, item.pending)
    };
    out.push_str(&format!(
        "{prefix}{branch}{} [{}]{counts}\n",
        item.name, item.item_type
    ));

    let child_prefix = format!("{prefix}{}", if last { "    " } else { "│   " });
    for (index, child) in item.children.iter().enumerate() {
        render_item(child, &child_prefix, index + 1 == item.children.len(), out);
    }
}
