//! SQL values and the statements the core hands to the database layer.
//!
//! The core never talks to a database directly; it produces parameterized
//! COUNT and SELECT statements (prefilter plus the current tuple's local
//! group-by predicates, ordered by the linking column) and consumes rows
//! through the [`crate::source::RowSource`] seam.

use std::cmp::Ordering;
use std::fmt;

use crate::decimal::Decimal;
use crate::domain::DomainIterator;
use crate::party::Party;
use crate::query::{Query, QueryError};

/// One SQL value: a bound parameter, a domain literal or a fetched cell.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// A whole number.
    Int(i64),
    /// A fixed-point number.
    Dec(Decimal),
    /// Text.
    Text(String),
}

impl SqlValue {
    /// Whether this is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Numeric view, if the value is numeric.
    pub fn to_decimal(&self) -> Option<Decimal> {
        match self {
            SqlValue::Int(v) => Some(Decimal::from_i64(*v)),
            SqlValue::Dec(d) => Some(d.clone()),
            _ => None,
        }
    }

    /// Three-way comparison with SQL semantics: anything involving NULL or
    /// mixed text/number operands compares as unknown.
    pub fn compare(&self, other: &SqlValue) -> Option<Ordering> {
        match (self, other) {
            (SqlValue::Text(a), SqlValue::Text(b)) => Some(a.cmp(b)),
            (SqlValue::Null, _) | (_, SqlValue::Null) => None,
            (a, b) => Some(a.to_decimal()?.cmp(&b.to_decimal()?)),
        }
    }
}

impl serde::Serialize for SqlValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SqlValue::Null => serializer.serialize_none(),
            SqlValue::Int(v) => serializer.serialize_i64(*v),
            // Decimals serialize as strings so no precision is lost.
            SqlValue::Dec(d) => serializer.collect_str(d),
            SqlValue::Text(t) => serializer.serialize_str(t),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("null"),
            SqlValue::Int(v) => write!(f, "{v}"),
            SqlValue::Dec(d) => write!(f, "{d}"),
            SqlValue::Text(t) => write!(f, "{t}"),
        }
    }
}

/// A parameterized SQL statement with `?` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// The statement text.
    pub sql: String,
    /// Bound parameters, in placeholder order.
    pub params: Vec<SqlValue>,
}

/// The row-counting statement for the current tuple.
pub fn count_statement(
    query: &Query,
    db: Party,
    domain: &DomainIterator,
) -> Result<Statement, QueryError> {
    let table = query.lexicon().table(db);
    let mut sql = format!("SELECT COUNT(*) FROM {}", table.name);
    let params = where_clause(query, db, domain, &mut sql)?;
    Ok(Statement { sql, params })
}

/// The streaming row statement for the current tuple: the linking column and
/// this party's aggregate projections, ordered by the linking column.
pub fn select_statement(
    query: &Query,
    db: Party,
    domain: &DomainIterator,
) -> Result<Statement, QueryError> {
    let lexicon = query.lexicon();
    let table = lexicon.table(db);
    let mut sql = format!("SELECT {}", table.linking_column);
    for aggregate in query.aggregates_for(db) {
        sql.push_str(", ");
        aggregate.to_sql(lexicon, &mut sql);
    }
    sql.push_str(" FROM ");
    sql.push_str(&table.name);
    let params = where_clause(query, db, domain, &mut sql)?;
    sql.push_str(" ORDER BY ");
    sql.push_str(&table.linking_column);
    Ok(Statement { sql, params })
}

fn where_clause(
    query: &Query,
    db: Party,
    domain: &DomainIterator,
    sql: &mut String,
) -> Result<Vec<SqlValue>, QueryError> {
    let mut params = Vec::new();
    sql.push_str(" WHERE 1 = 1");
    if let Some(prefilter) = query.prefilter(db) {
        prefilter.to_sql(query.lexicon(), sql, &mut params);
    }
    domain.to_sql(sql, &mut params)?;
    Ok(params)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::lexicon::tests::test_lexicon;

    #[test]
    fn value_comparisons() {
        let two = SqlValue::Int(2);
        let two_dec = SqlValue::Dec("2.0".parse().unwrap());
        let three = SqlValue::Int(3);
        assert_eq!(two.compare(&two_dec), Some(Ordering::Equal));
        assert_eq!(two.compare(&three), Some(Ordering::Less));
        assert_eq!(two.compare(&SqlValue::Null), None);
        assert_eq!(two.compare(&SqlValue::Text("2".into())), None);
        assert_eq!(
            SqlValue::Text("a".into()).compare(&SqlValue::Text("b".into())),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn generated_statements() {
        let lexicon = Arc::new(test_lexicon("97"));
        let query = Arc::new(
            Query::parse(
                "aggregate=sum:amount&group_by=region&prefilter=incomes:amount>0",
                lexicon,
            )
            .unwrap(),
        );
        let mut domain = DomainIterator::new(Arc::clone(&query), Party::Db1).unwrap();
        assert!(domain.next());

        let count = count_statement(&query, Party::Db1, &domain).unwrap();
        assert_eq!(
            count.sql,
            "SELECT COUNT(*) FROM incomes WHERE 1 = 1 AND amount > ? AND region = ?"
        );
        assert_eq!(count.params.len(), 2);
        assert_eq!(count.params[1], SqlValue::Text("east".into()));

        let select = select_statement(&query, Party::Db1, &domain).unwrap();
        assert!(select.sql.starts_with(
            "SELECT person_id, (CASE WHEN amount IS NULL THEN 0 ELSE amount END) FROM incomes"
        ));
        assert!(select.sql.ends_with("ORDER BY person_id"));
        assert_eq!(select.params, count.params);

        // DB2 sees no DB1 predicates, only its own (none here beyond 1 = 1).
        let domain2 = {
            let mut d = DomainIterator::new(Arc::clone(&query), Party::Db2).unwrap();
            assert!(d.next());
            d
        };
        let count2 = count_statement(&query, Party::Db2, &domain2).unwrap();
        assert_eq!(count2.sql, "SELECT COUNT(*) FROM degrees WHERE 1 = 1");
        assert!(count2.params.is_empty());
    }
}
