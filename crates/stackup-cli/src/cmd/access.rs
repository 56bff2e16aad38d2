use crate::output::print_json;
use stackup_core::exec::SystemRunner;
use stackup_core::report::{access_instructions, render};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let runner = SystemRunner::new();
    let info = super::runtime()?.block_on(access_instructions(&config, &runner));
    if json {
        print_json(&info)
    } else {
        println!("{}", render(&info));
        Ok(())
    }
}
