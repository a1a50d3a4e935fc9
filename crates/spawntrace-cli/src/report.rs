//! Dependency report rendering.

use std::io::{self, Write};

use clap::ValueEnum;
use console::style;
use serde::Serialize;
use spawntrace_config::ReportConfig;
use spawntrace_core::{Gap, Snapshot, SnapshotRow};

const WIDTH: usize = 108;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Table,
    Json,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    #[serde(flatten)]
    snapshot: &'a Snapshot,
    gaps: Vec<Gap>,
}

pub fn render<W: Write>(
    out: &mut W,
    snapshot: &Snapshot,
    opts: &ReportConfig,
    format: Format,
) -> io::Result<()> {
    match format {
        Format::Table => render_table(out, snapshot, opts),
        Format::Json => {
            let report = JsonReport {
                snapshot,
                gaps: snapshot.gaps(),
            };
            serde_json::to_writer_pretty(&mut *out, &report)?;
            writeln!(out)
        }
    }
}

fn count(v: Option<u64>) -> String {
    v.map_or_else(|| "-".to_string(), |n| n.to_string())
}

fn rule<W: Write>(out: &mut W, c: char) -> io::Result<()> {
    writeln!(out, "{}", c.to_string().repeat(WIDTH))
}

fn section<W: Write>(out: &mut W, header: &str) -> io::Result<()> {
    rule(out, '=')?;
    writeln!(out, "{}", style(header).bold())?;
    rule(out, '-')
}

fn render_table<W: Write>(out: &mut W, snapshot: &Snapshot, opts: &ReportConfig) -> io::Result<()> {
    section(
        out,
        "Child Thread    Parent Thread    pthread_create at    Thread Start    Thread Terminate    #Instructions Run",
    )?;
    for row in &snapshot.rows {
        writeln!(
            out,
            "{:>12}    {:>13}    {:>17}    {:>12}    {:>16}    {:>17}",
            row.index.0,
            row.parent.0,
            count(row.spawn_call_count),
            count(row.start_count),
            count(row.terminate_count),
            count(row.self_instruction_count),
        )?;
    }

    if !snapshot.roots.is_empty() {
        section(out, "Root Thread    #Instructions Run")?;
        for root in &snapshot.roots {
            writeln!(
                out,
                "{:>11}    {:>17}",
                root.index.0,
                count(root.self_instruction_count)
            )?;
        }
    }

    if opts.show_identities {
        section(out, "External ID    Thread Index")?;
        for (index, external) in &snapshot.identities {
            writeln!(out, "{:>11}    {:>12}", external.0, index.0)?;
        }
    }

    if opts.show_spawn_order {
        section(out, "Parent thread ID  spawn order  start order  Thread ID")?;
        let mut rows: Vec<&SnapshotRow> = snapshot.rows.iter().collect();
        rows.sort_by_key(|r| (r.parent, r.spawn_order.is_none(), r.spawn_order, r.start_order));
        for row in rows {
            let spawn = row
                .spawn_order
                .map_or_else(|| "-".to_string(), |n| n.to_string());
            writeln!(
                out,
                "{:>16}  {:>11}  {:>11}  {:>9}",
                row.parent.0, spawn, row.start_order, row.index.0
            )?;
        }
    }

    let gaps = snapshot.gaps();
    if !gaps.is_empty() || !snapshot.faults.is_empty() {
        rule(out, '=')?;
        for gap in &gaps {
            writeln!(out, "{} {}", style("gap:").yellow().bold(), gap)?;
        }
        for fault in &snapshot.faults {
            writeln!(
                out,
                "{} {}: {}",
                style("fault:").red().bold(),
                fault.event,
                fault.error
            )?;
        }
    }

    rule(out, '=')?;
    if snapshot.halted {
        writeln!(out, "{}", style("Trace halted after a fatal error (partial report)").red())?;
    }
    Ok(())
}
