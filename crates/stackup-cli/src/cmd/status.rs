use crate::output::print_json;
use stackup_core::cluster::snapshot;
use stackup_core::exec::SystemRunner;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let runner = SystemRunner::new();
    let snap = super::runtime()?.block_on(snapshot(
        &runner,
        &config.cluster.profile,
        &config.namespace_wait.namespace,
    ))?;

    if json {
        return print_json(&snap);
    }
    println!("cluster {}: {}", snap.profile, snap.host);
    if !snap.nodes.is_empty() {
        println!("\n{}", snap.nodes);
    }
    if !snap.pods.is_empty() {
        println!("\npods in {}:\n{}", config.namespace_wait.namespace, snap.pods);
    }
    Ok(())
}
