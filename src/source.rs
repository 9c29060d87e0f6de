//! The seam between the core and the database access layer.
//!
//! The core plans one COUNT and one ordered SELECT per domain tuple and hands
//! them to a [`RowSource`]. Real deployments implement the trait over their
//! database driver by executing [`RowPlan::statement`]; [`MemorySource`]
//! implements the same semantics over in-memory tables for tests and
//! databaseless embeddings.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;

use crate::lexicon::Lexicon;
use crate::party::Party;
use crate::query::{Query, QueryError};
use crate::sql::{self, SqlValue, Statement};
use crate::domain::DomainIterator;

/// A database-layer failure. Always fatal for the handler that hit it.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The backend rejected or aborted the statement.
    #[error("database error: {0}")]
    Backend(String),
    /// The plan could not be rendered.
    #[error("{0}")]
    Plan(#[from] QueryError),
}

/// One fetched row: the linking key and the projected aggregate values.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    /// The linking column, exactly `linking_column_size` bytes, in a byte
    /// order matching the backend's ORDER BY collation.
    pub link: Vec<u8>,
    /// The non-virtual projection values, in aggregate order.
    pub values: Vec<SqlValue>,
}

/// An executable per-tuple plan: the rendered statement plus enough semantic
/// context for backends that do not speak SQL.
#[derive(Debug, Clone)]
pub struct RowPlan {
    /// The local data holder.
    pub db: Party,
    /// The query being served.
    pub query: Arc<Query>,
    /// The parameterized statement a SQL backend should execute.
    pub statement: Statement,
    /// The current tuple's local group-by bindings (column name, value).
    pub group_bindings: Vec<(String, SqlValue)>,
}

impl RowPlan {
    /// Plans the COUNT for the current tuple of `domain`.
    pub fn count(
        query: &Arc<Query>,
        db: Party,
        domain: &DomainIterator,
    ) -> Result<RowPlan, QueryError> {
        Ok(RowPlan {
            db,
            query: Arc::clone(query),
            statement: sql::count_statement(query, db, domain)?,
            group_bindings: bindings(query, db, domain)?,
        })
    }

    /// Plans the ordered SELECT for the current tuple of `domain`.
    pub fn select(
        query: &Arc<Query>,
        db: Party,
        domain: &DomainIterator,
    ) -> Result<RowPlan, QueryError> {
        Ok(RowPlan {
            db,
            query: Arc::clone(query),
            statement: sql::select_statement(query, db, domain)?,
            group_bindings: bindings(query, db, domain)?,
        })
    }
}

fn bindings(
    query: &Query,
    db: Party,
    domain: &DomainIterator,
) -> Result<Vec<(String, SqlValue)>, QueryError> {
    let mut sql = String::new();
    let mut params = Vec::new();
    domain.to_sql(&mut sql, &mut params)?;
    let names = query
        .group_bys()
        .iter()
        .filter(|c| c.db == db)
        .map(|&c| query.lexicon().column(c).name.clone());
    Ok(names.zip(params).collect())
}

/// A streaming cursor over the rows of one SELECT.
pub trait RowCursor: Send {
    /// The next row, or `None` at the end of the result set.
    fn next_row(
        &mut self,
    ) -> impl Future<Output = Result<Option<SourceRow>, SourceError>> + Send;
}

/// The database access layer, as seen from the core.
pub trait RowSource: Send + Sync + 'static {
    /// The cursor type produced by [`RowSource::select`].
    type Cursor: RowCursor;

    /// Executes the COUNT plan.
    fn count(&self, plan: &RowPlan) -> impl Future<Output = Result<u64, SourceError>> + Send;

    /// Executes the SELECT plan, returning rows ordered by the linking
    /// column.
    fn select(
        &self,
        plan: &RowPlan,
    ) -> impl Future<Output = Result<Self::Cursor, SourceError>> + Send;
}

/// An in-memory [`RowSource`] over one table.
#[derive(Debug, Clone)]
pub struct MemorySource {
    lexicon: Arc<Lexicon>,
    db: Party,
    rows: Vec<MemRow>,
}

#[derive(Debug, Clone)]
struct MemRow {
    link: Vec<u8>,
    values: BTreeMap<String, SqlValue>,
}

impl MemorySource {
    /// An empty table for `db`.
    pub fn new(lexicon: Arc<Lexicon>, db: Party) -> MemorySource {
        assert!(db.is_db());
        MemorySource {
            lexicon,
            db,
            rows: Vec::new(),
        }
    }

    /// Adds one row. The link is zero-padded on the right to the configured
    /// linking column width; longer links panic.
    pub fn add_row(&mut self, link: &[u8], values: Vec<(&str, SqlValue)>) {
        let width = self.lexicon.common.linking_column_size as usize;
        assert!(
            link.len() <= width,
            "link is wider than linking_column_size"
        );
        let mut padded = link.to_vec();
        padded.resize(width, 0);
        self.rows.push(MemRow {
            link: padded,
            values: values
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        });
    }

    fn matching(&self, plan: &RowPlan) -> Vec<&MemRow> {
        let lexicon = &self.lexicon;
        self.rows
            .iter()
            .filter(|row| {
                let value_of = |name: &str| {
                    row.values.get(name).cloned().unwrap_or(SqlValue::Null)
                };
                let prefilter_ok = plan
                    .query
                    .prefilter(self.db)
                    .is_none_or(|c| c.matches(lexicon, value_of));
                let groups_ok = plan.group_bindings.iter().all(|(name, want)| {
                    value_of(name)
                        .compare(want)
                        .is_some_and(|ord| ord == std::cmp::Ordering::Equal)
                });
                prefilter_ok && groups_ok
            })
            .collect()
    }
}

impl RowSource for MemorySource {
    type Cursor = MemoryCursor;

    async fn count(&self, plan: &RowPlan) -> Result<u64, SourceError> {
        Ok(self.matching(plan).len() as u64)
    }

    async fn select(&self, plan: &RowPlan) -> Result<MemoryCursor, SourceError> {
        let mut matched = self.matching(plan);
        matched.sort_by(|a, b| a.link.cmp(&b.link));
        let rows = matched
            .into_iter()
            .map(|row| {
                let mut values = Vec::new();
                for aggregate in plan.query.aggregates_for(self.db) {
                    let name = &self.lexicon.column(aggregate.column).name;
                    let value = row.values.get(name).cloned().unwrap_or(SqlValue::Null);
                    values.extend(aggregate.project(&value));
                }
                SourceRow {
                    link: row.link.clone(),
                    values,
                }
            })
            .collect::<Vec<_>>();
        Ok(MemoryCursor {
            rows: rows.into_iter(),
        })
    }
}

/// Cursor over a pre-materialized in-memory result set.
pub struct MemoryCursor {
    rows: std::vec::IntoIter<SourceRow>,
}

impl RowCursor for MemoryCursor {
    async fn next_row(&mut self) -> Result<Option<SourceRow>, SourceError> {
        Ok(self.rows.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexicon::tests::test_lexicon;

    fn setup() -> (Arc<Lexicon>, Arc<Query>, MemorySource) {
        let lexicon = Arc::new(test_lexicon("4294967291"));
        let query = Arc::new(
            Query::parse(
                "aggregate=sum:amount&group_by=region&prefilter=incomes:amount>=5.00",
                Arc::clone(&lexicon),
            )
            .unwrap(),
        );
        let mut source = MemorySource::new(Arc::clone(&lexicon), Party::Db1);
        source.add_row(
            b"b",
            vec![
                ("amount", SqlValue::Dec("10.00".parse().unwrap())),
                ("region", SqlValue::Text("east".into())),
            ],
        );
        source.add_row(
            b"a",
            vec![
                ("amount", SqlValue::Dec("7.50".parse().unwrap())),
                ("region", SqlValue::Text("east".into())),
            ],
        );
        source.add_row(
            b"c",
            vec![
                ("amount", SqlValue::Dec("2.00".parse().unwrap())), // prefiltered out
                ("region", SqlValue::Text("east".into())),
            ],
        );
        source.add_row(
            b"d",
            vec![
                ("amount", SqlValue::Dec("9.00".parse().unwrap())),
                ("region", SqlValue::Text("west".into())),
            ],
        );
        (lexicon, query, source)
    }

    #[tokio::test]
    async fn counts_and_selects_with_predicates() {
        let (_lexicon, query, source) = setup();
        let mut domain = DomainIterator::new(Arc::clone(&query), Party::Db1).unwrap();
        assert!(domain.next()); // region = east

        let count = RowPlan::count(&query, Party::Db1, &domain).unwrap();
        assert_eq!(source.count(&count).await.unwrap(), 2);

        let select = RowPlan::select(&query, Party::Db1, &domain).unwrap();
        let mut cursor = source.select(&select).await.unwrap();
        let first = cursor.next_row().await.unwrap().unwrap();
        // Sorted by padded link bytes.
        assert_eq!(&first.link[..1], b"a");
        assert_eq!(first.values, vec![SqlValue::Dec("7.50".parse().unwrap())]);
        let second = cursor.next_row().await.unwrap().unwrap();
        assert_eq!(&second.link[..1], b"b");
        assert!(cursor.next_row().await.unwrap().is_none());

        assert!(domain.next()); // region = west
        let count = RowPlan::count(&query, Party::Db1, &domain).unwrap();
        assert_eq!(source.count(&count).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_columns_read_as_null() {
        let (lexicon, _query, mut source) = setup();
        let query = Arc::new(
            Query::parse("aggregate=count:amount&group_by=region", lexicon).unwrap(),
        );
        source.add_row(b"e", vec![("region", SqlValue::Text("east".into()))]);
        let mut domain = DomainIterator::new(Arc::clone(&query), Party::Db1).unwrap();
        assert!(domain.next());
        let select = RowPlan::select(&query, Party::Db1, &domain).unwrap();
        let mut cursor = source.select(&select).await.unwrap();
        let mut rows = Vec::new();
        while let Some(row) = cursor.next_row().await.unwrap() {
            rows.push(row);
        }
        // All four east rows match without the prefilter; the null amount
        // projects a zero count indicator.
        assert_eq!(rows.len(), 4);
        let last = rows.iter().find(|r| &r.link[..1] == b"e").unwrap();
        assert_eq!(last.values, vec![SqlValue::Int(0)]);
    }
}
