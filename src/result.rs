//! Query results and progress reporting.

use std::fmt;

use serde::Serialize;

use crate::query::Query;
use crate::sql::SqlValue;

/// A completed query: one row per domain tuple, in domain order.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResultTable {
    /// Column headers: group-by columns first, then one label per aggregate.
    pub columns: Vec<String>,
    /// Rows, each as wide as `columns`.
    pub rows: Vec<ResultRow>,
}

/// One output row.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResultRow {
    /// Cells in column order; aggregate cells may be null.
    pub cells: Vec<SqlValue>,
}

impl ResultTable {
    /// An empty table with the headers of `query`.
    pub fn for_query(query: &Query) -> ResultTable {
        let mut columns = Vec::new();
        for &id in query.group_bys() {
            let table = &query.lexicon().table(id.db).name;
            columns.push(format!("{table}.{}", query.lexicon().column(id).name));
        }
        for aggregate in query.aggregates() {
            columns.push(aggregate.label(query.lexicon()));
        }
        ResultTable {
            columns,
            rows: Vec::new(),
        }
    }
}

impl fmt::Display for ResultTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.columns.join(" | "))?;
        for row in &self.rows {
            let cells: Vec<String> = row.cells.iter().map(|c| c.to_string()).collect();
            writeln!(f, "{}", cells.join(" | "))?;
        }
        Ok(())
    }
}

/// Per-tuple progress of a running query, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Domain tuples fully merged so far.
    pub tuples_done: u64,
    /// Total domain tuples.
    pub tuples_total: u64,
    /// Rows each data holder selected for the last merged tuple.
    pub db_rows: [u64; 2],
}

impl Progress {
    /// Progress before the first tuple.
    pub fn start(tuples_total: u64) -> Progress {
        Progress {
            tuples_done: 0,
            tuples_total,
            db_rows: [0, 0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexicon::tests::test_lexicon;
    use std::sync::Arc;

    #[test]
    fn headers_follow_group_bys_then_aggregates() {
        let lexicon = Arc::new(test_lexicon("4294967291"));
        let query = Query::parse(
            "aggregate=avg:amount&aggregate=count:years&group_by=region&group_by=school",
            lexicon,
        )
        .unwrap();
        let table = ResultTable::for_query(&query);
        assert_eq!(
            table.columns,
            vec![
                "incomes.region",
                "degrees.school",
                "avg(incomes.amount)",
                "count(degrees.years)",
            ]
        );
        assert!(table.rows.is_empty());
    }
}
