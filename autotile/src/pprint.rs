use prettytable::{self, format, row};
use std::fmt;

use crate::case::TilingCase;
use crate::schedule::{Schedule, ScheduleNode};
use crate::target::BufferScope;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum PrintFormat {
    Cases,
    Schedules,
}

/// Pretty-print tiling cases, one row per case, to stdout.
pub fn pprint_cases(cases: &[TilingCase]) {
    cases_table(cases).printstd()
}

pub fn pprint_schedule(schedule: &Schedule) {
    schedule_table(schedule).printstd()
}

pub fn cases_string(cases: &[TilingCase]) -> String {
    format!("{}", cases_table(cases))
}

/// Pretty-print a [Schedule] to a given [fmt::Write].
pub fn pprint_schedule_write<W: fmt::Write>(out: &mut W, schedule: &Schedule) -> fmt::Result {
    write!(out, "{}", schedule_table(schedule))
}

fn compact_format() -> format::TableFormat {
    format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build()
}

fn cases_table(cases: &[TilingCase]) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    table.set_titles(row![
        "Key", "Pattern", "Block", "UB", "Atomic", "DB", "Special", "Region"
    ]);
    let axis = |a: Option<u8>, bound| a.map_or("-".to_owned(), |a| format!("{a} {bound}"));
    for c in cases {
        table.add_row(row![
            c.tiling_key(),
            c.pattern,
            axis(c.block_split_axis, c.block_factor_bound),
            axis(c.ub_split_axis, c.ub_factor_bound),
            c.is_atomic,
            c.is_db,
            c.special,
            c.region
        ]);
    }
    table.set_format(compact_format());
    table
}

fn schedule_table(schedule: &Schedule) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    table.set_titles(row!["Schedule", "Scope", "Compute at", "Bytes", "DB", "Reuses"]);
    schedule_rows(&mut table, &schedule.roots, 0);
    let peaks = [BufferScope::Ub, BufferScope::L1, BufferScope::L0c]
        .iter()
        .map(|s| format!("{s}={}", schedule.peak_bytes[s.index()]))
        .collect::<Vec<_>>()
        .join(" ");
    table.add_row(row![format!("/* case {}, peak {} */", schedule.case.tiling_key(), peaks)]);
    table.set_format(compact_format());
    table
}

fn schedule_rows(table: &mut prettytable::Table, nodes: &[ScheduleNode], depth: usize) {
    let indent = " ".repeat(depth * 2);
    for n in nodes {
        match n {
            ScheduleNode::Loop(l) => {
                table.add_row(row![format!(
                    "{indent}for {} {} in {}",
                    l.var.kind, l.var.axis, l.var.factor
                )]);
                schedule_rows(table, &l.body, depth + 1);
            }
            ScheduleNode::Stage(s) => {
                let name = s.node.map_or("-".to_owned(), |n| n.to_string());
                table.add_row(row![
                    format!("{indent}{name} = {}", s.insn),
                    s.scope,
                    s.compute_at,
                    s.bytes,
                    if s.double_buffer { "x2" } else { "" },
                    s.reuses.map_or(String::new(), |r| r.to_string())
                ]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Pattern;
    use crate::common::{DimRange, Dtype};
    use crate::dag::{ComputeDag, ElemOp};
    use crate::generate::generate_cases;
    use crate::schedule::build_schedule;
    use crate::target::CloudTarget;

    #[test]
    fn test_schedule_table_lists_loops_and_stages() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::new(1, 65536)], Dtype::Float32);
        let y = b.elementwise(ElemOp::Exp, &[x]);
        b.output(y);
        let dag = b.build().unwrap();
        let cases = generate_cases::<CloudTarget>(&dag, Pattern::ElementwiseOnly).unwrap();
        let schedule = build_schedule::<CloudTarget>(&dag, cases.last().unwrap()).unwrap();
        let mut out = String::new();
        pprint_schedule_write(&mut out, &schedule).unwrap();
        assert!(out.contains("for Block 0"));
        assert!(out.contains("%1 = vexp"));
        assert!(out.contains("copy_out"));
        let listing = cases_string(&cases);
        assert_eq!(listing.lines().count(), cases.len() + 2);
    }
}
