use serde::Serialize;
use stackup_core::pipeline::RunReport;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{json}");
    Ok(())
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }
    }

    let line = |cells: Vec<String>| {
        let padded: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let w = widths.get(i).copied().unwrap_or(0);
                format!("{cell:w$}")
            })
            .collect();
        println!("{}", padded.join("  ").trim_end());
    };

    line(headers.iter().map(|h| h.to_string()).collect());
    line(widths.iter().map(|&w| "-".repeat(w)).collect());
    for row in rows {
        line(row);
    }
}

/// One row per stage: name, status, duration, detail.
pub fn print_stage_table(report: &RunReport) {
    let rows = report
        .stages
        .iter()
        .map(|s| {
            vec![
                s.stage.to_string(),
                s.status.to_string(),
                format_duration(s.duration_ms),
                s.detail.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["STAGE", "STATUS", "TIME", "DETAIL"], rows);
}

pub fn format_duration(ms: u64) -> String {
    match ms {
        0 => "-".to_string(),
        1..=999 => format!("{ms}ms"),
        1_000..=59_999 => format!("{:.1}s", ms as f64 / 1000.0),
        _ => format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000),
    }
}
