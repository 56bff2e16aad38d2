use crate::output::{print_json, print_stage_table};
use crate::signal;
use anyhow::Context;
use stackup_core::context::ExecutionContext;
use stackup_core::exec::SystemRunner;
use stackup_core::guard::ReexecPlan;
use stackup_core::pipeline::{Pipeline, PipelineOutcome, RunOptions, RunReport, Stage};
use stackup_core::report::render;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::Path;

pub struct UpArgs {
    pub from_stage: Option<Stage>,
    pub skip_health: bool,
    pub reexec_depth: u32,
}

pub fn run(root: &Path, args: UpArgs, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let workdir = root.to_path_buf();
    let ctx = ExecutionContext::capture(&config.runtime.group, workdir, args.reexec_depth)
        .context("failed to read the execution context")?;
    let runner = SystemRunner::new();
    let opts = RunOptions {
        from_stage: args.from_stage,
        skip_health: args.skip_health,
    };

    let mut pipeline = Pipeline::new(&config, root, &runner, ctx, opts);
    let outcome = super::runtime()?.block_on(pipeline.run(signal::shutdown()));
    let report = pipeline.report();

    match outcome {
        Ok(PipelineOutcome::Reexec { group, resume_from }) => {
            reexec(&group, resume_from, args.reexec_depth + 1)
        }
        Ok(PipelineOutcome::Completed) => {
            print_report(report, "completed", json)?;
            if !json {
                if let Some(access) = &report.access {
                    println!("\n{}", render(access));
                }
            }
            Ok(())
        }
        Ok(PipelineOutcome::Interrupted) => {
            print_report(report, "interrupted", json)?;
            Err(super::Interrupted.into())
        }
        Err(e) => {
            print_report(report, "failed", json)?;
            Err(e.into())
        }
    }
}

fn print_report(report: &RunReport, outcome: &str, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&serde_json::json!({ "outcome": outcome, "report": report }));
    }
    println!();
    print_stage_table(report);
    if report.degraded() {
        println!("\nsome stages are degraded; see the warnings above");
    }
    Ok(())
}

/// Replace this process with one started under `group`. Only returns on
/// failure.
fn reexec(group: &str, resume_from: Stage, depth: u32) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("cannot locate the stackup binary")?;
    let argv: Vec<String> = std::env::args().collect();
    let argv = reexec_argv(&argv, &exe.display().to_string(), resume_from, depth);
    let plan = ReexecPlan::new(group, &argv);

    tracing::info!(group, resume_from = %resume_from, depth, "re-executing");
    let _ = std::io::stdout().flush();
    let err = std::process::Command::new(&plan.program)
        .args(&plan.args)
        .env("STACKUP_REEXEC_DEPTH", depth.to_string())
        .exec();
    Err(err).with_context(|| {
        format!(
            "failed to re-exec under group '{group}' via {}",
            plan.program
        )
    })
}

/// The current argv with resume flags replaced.
fn reexec_argv(argv: &[String], exe: &str, resume_from: Stage, depth: u32) -> Vec<String> {
    let mut out = vec![exe.to_string()];
    let mut rest = argv.iter().skip(1);
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--from-stage" | "--reexec-depth" => {
                rest.next();
            }
            a if a.starts_with("--from-stage=") || a.starts_with("--reexec-depth=") => {}
            _ => out.push(arg.clone()),
        }
    }
    out.extend([
        "--from-stage".to_string(),
        resume_from.to_string(),
        "--reexec-depth".to_string(),
        depth.to_string(),
    ]);
    out
}
