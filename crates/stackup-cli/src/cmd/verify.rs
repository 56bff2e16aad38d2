use crate::output::print_json;
use crate::signal;
use stackup_core::exec::SystemRunner;
use stackup_core::health::{verify_http_health, HealthSpec, HealthVerdict};
use std::path::Path;

/// Health check only. Unlike `up`, an unhealthy verdict is a failure here.
pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let runner = SystemRunner::new();
    let spec = HealthSpec::from_config(&config.health, &config.namespace_wait.namespace);
    let verdict =
        super::runtime()?.block_on(verify_http_health(&runner, &spec, signal::shutdown()));

    if json {
        print_json(&verdict)?;
    }
    match verdict {
        HealthVerdict::Healthy { attempts } => {
            if !json {
                println!("{} is UP (attempt {attempts})", spec.url());
            }
            Ok(())
        }
        HealthVerdict::Unhealthy {
            attempts,
            last_error,
        } => anyhow::bail!("{} not UP after {attempts} attempt(s): {last_error}", spec.url()),
        HealthVerdict::Interrupted => Err(super::Interrupted.into()),
    }
}
