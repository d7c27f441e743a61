use crate::expr::{Expr, SortExpr};
use crate::logical_plan::{LogicalPlan, Partitioning};

/// Render logical plan as human-readable multiline text.
pub fn explain_logical(plan: &LogicalPlan) -> String {
    let mut s = String::new();
    fmt_plan(plan, 0, &mut s);
    s
}

fn fmt_plan(plan: &LogicalPlan, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    match plan {
        LogicalPlan::TableScan {
            table,
            projection,
            filters,
            fetch,
            schema,
            ..
        } => {
            out.push_str(&format!("{pad}TableScan table={table}"));
            if projection.is_some() {
                out.push_str(&format!(
                    " projection=[{}]",
                    schema
                        .fields()
                        .iter()
                        .map(|f| f.name().as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            }
            if !filters.is_empty() {
                out.push_str(&format!(" filters=[{}]", fmt_exprs(filters)));
            }
            if let Some(n) = fetch {
                out.push_str(&format!(" fetch={n}"));
            }
            out.push('\n');
        }
        LogicalPlan::Projection { exprs, input, .. } => {
            out.push_str(&format!("{pad}Projection {}\n", fmt_exprs(exprs)));
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Filter { predicate, input } => {
            out.push_str(&format!("{pad}Filter {predicate}\n"));
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Aggregate {
            group_exprs,
            aggr_exprs,
            input,
            ..
        } => {
            out.push_str(&format!(
                "{pad}Aggregate group_by=[{}] aggs=[{}]\n",
                fmt_exprs(group_exprs),
                fmt_exprs(aggr_exprs)
            ));
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Sort { exprs, input } => {
            out.push_str(&format!("{pad}Sort {}\n", fmt_sort(exprs)));
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Join {
            left,
            right,
            on,
            filter,
            join_type,
            ..
        } => {
            let keys = on
                .iter()
                .map(|(l, r)| format!("{l} = {r}"))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!("{pad}Join type={join_type} on=[{keys}]"));
            if let Some(f) = filter {
                out.push_str(&format!(" filter={f}"));
            }
            out.push('\n');
            fmt_plan(left, indent + 1, out);
            fmt_plan(right, indent + 1, out);
        }
        LogicalPlan::Limit { skip, fetch, input } => {
            match fetch {
                Some(n) => out.push_str(&format!("{pad}Limit skip={skip} fetch={n}\n")),
                None => out.push_str(&format!("{pad}Limit skip={skip} fetch=None\n")),
            }
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Union { inputs, .. } => {
            out.push_str(&format!("{pad}Union\n"));
            for i in inputs {
                fmt_plan(i, indent + 1, out);
            }
        }
        LogicalPlan::SetOperation {
            op,
            all,
            left,
            right,
            ..
        } => {
            out.push_str(&format!("{pad}{op:?} all={all}\n"));
            fmt_plan(left, indent + 1, out);
            fmt_plan(right, indent + 1, out);
        }
        LogicalPlan::Distinct { input } => {
            out.push_str(&format!("{pad}Distinct\n"));
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Window {
            window_exprs,
            input,
            ..
        } => {
            out.push_str(&format!("{pad}Window {}\n", fmt_exprs(window_exprs)));
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Unnest {
            columns,
            preserve_nulls,
            input,
            ..
        } => {
            out.push_str(&format!(
                "{pad}Unnest columns=[{}] preserve_nulls={preserve_nulls}\n",
                columns.join(", ")
            ));
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Repartition {
            partitioning,
            input,
        } => {
            match partitioning {
                Partitioning::RoundRobin(n) => {
                    out.push_str(&format!("{pad}Repartition round_robin={n}\n"))
                }
                Partitioning::Hash(exprs, n) => out.push_str(&format!(
                    "{pad}Repartition hash=[{}] partitions={n}\n",
                    fmt_exprs(exprs)
                )),
            }
            fmt_plan(input, indent + 1, out);
        }
    }
}

fn fmt_exprs(exprs: &[Expr]) -> String {
    exprs
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn fmt_sort(exprs: &[SortExpr]) -> String {
    exprs
        .iter()
        .map(|s| {
            format!(
                "{} {} {}",
                s.expr,
                if s.asc { "ASC" } else { "DESC" },
                if s.nulls_first {
                    "NULLS FIRST"
                } else {
                    "NULLS LAST"
                }
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_schema::{DataType, Field, Schema};

    use crate::builder::LogicalPlanBuilder;
    use crate::expr_fn::{col, lit, sum};
    use crate::logical_plan::JoinType;

    #[test]
    fn renders_nested_plan_with_indentation() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Int64, true),
        ]));
        let right = LogicalPlanBuilder::scan("r", Arc::clone(&schema))
            .expect("scan")
            .build();
        let plan = LogicalPlanBuilder::scan("l", schema)
            .expect("scan")
            .join(
                right,
                JoinType::Inner,
                vec!["k".to_string()],
                vec!["k".to_string()],
                None,
            )
            .expect("join")
            .filter(vec![col("v").gt(lit(1i64))])
            .expect("filter")
            .aggregate(vec![col("k")], vec![sum(col("v"))])
            .expect("aggregate")
            .build();
        let text = plan.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("Aggregate group_by=[k] aggs=[sum(v)]"), "{text}");
        assert!(lines[1].starts_with("  Filter v > 1"), "{text}");
        assert!(lines[2].starts_with("    Join type=inner on=[k = k]"), "{text}");
        assert!(lines[3].starts_with("      TableScan table=l"), "{text}");
        assert!(lines[4].starts_with("      TableScan table=r"), "{text}");
    }
}
