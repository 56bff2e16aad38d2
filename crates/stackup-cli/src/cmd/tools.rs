use crate::output::{print_json, print_table};
use stackup_core::exec::SystemRunner;
use stackup_core::tools::{host_arch, inventory, inventory_status};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let user = std::env::var("USER").unwrap_or_default();
    let specs = inventory(&config.tools, &user, host_arch());
    let status = inventory_status(&specs, &SystemRunner::new());

    if json {
        return print_json(&status);
    }
    let rows = status
        .iter()
        .map(|t| {
            vec![
                t.name.clone(),
                t.pinned_version.clone(),
                t.installed_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "missing".to_string()),
            ]
        })
        .collect();
    print_table(&["TOOL", "PINNED", "INSTALLED"], rows);
    Ok(())
}
