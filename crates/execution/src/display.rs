use std::sync::Arc;

use crate::exec_node::ExecNode;

/// Render a physical plan as indented text, one operator per line.
///
/// With `with_metrics` each line carries the counters collected by the last
/// execution of that tree.
pub fn explain_physical(plan: &Arc<dyn ExecNode>, with_metrics: bool) -> String {
    let mut out = String::new();
    fmt_node(plan, 0, with_metrics, &mut out);
    out
}

fn fmt_node(node: &Arc<dyn ExecNode>, indent: usize, with_metrics: bool, out: &mut String) {
    let pad = "  ".repeat(indent);
    out.push_str(&format!("{pad}{}", node.name()));
    let details = node.details();
    if !details.is_empty() {
        out.push_str(&format!(": {details}"));
    }
    out.push_str(&format!(
        " partitions={}",
        node.output_partitioning().partition_count()
    ));
    if with_metrics {
        let m = node.metrics().snapshot();
        out.push_str(&format!(
            " metrics=[output_rows={}, output_batches={}, elapsed={:.3}ms",
            m.output_rows,
            m.output_batches,
            m.elapsed.as_secs_f64() * 1000.0
        ));
        if m.spill_count > 0 {
            out.push_str(&format!(
                ", spill_count={}, spill_bytes={}",
                m.spill_count, m.spill_bytes
            ));
        }
        out.push(']');
    }
    out.push('\n');
    for child in node.children() {
        fmt_node(&child, indent + 1, with_metrics, out);
    }
}
