//! Parsed queries: aggregates, group-bys and prefilters.
//!
//! A query travels between the parties as the query-string text it was
//! submitted with (`aggregate=fun:col&group_by=col&prefilter=table:cond`) and
//! is parsed independently by every party against the shared lexicon, so all
//! fourteen per-query handlers derive identical domain enumerations and
//! aggregate layouts from the same text.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::decimal::Decimal;
use crate::lexicon::{Column, ColumnId, ColumnType, Lexicon, LexiconError};
use crate::party::Party;
use crate::sql::SqlValue;

/// Errors raised while parsing a query string.
#[derive(Debug)]
pub enum QueryError {
    /// The query string is syntactically malformed.
    QueryString(String),
    /// A referenced table or column could not be resolved.
    Lexicon(LexiconError),
    /// A literal does not fit the column type.
    BadLiteral {
        /// The column the literal was bound to.
        column: String,
        /// The offending literal.
        literal: String,
    },
    /// The group-by domain product overflows a 32-bit tuple count.
    TooManyTuples,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::QueryString(reason) => write!(f, "invalid query string: {reason}"),
            QueryError::Lexicon(e) => write!(f, "{e}"),
            QueryError::BadLiteral { column, literal } => {
                write!(f, "literal {literal:?} does not fit column {column:?}")
            }
            QueryError::TooManyTuples => {
                write!(f, "the group-by domain product exceeds 2^31 - 1 tuples")
            }
        }
    }
}

impl std::error::Error for QueryError {}

impl From<LexiconError> for QueryError {
    fn from(e: LexiconError) -> Self {
        QueryError::Lexicon(e)
    }
}

/// The closed set of supported aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    /// Number of non-null values.
    Count,
    /// Sum of values.
    Sum,
    /// Arithmetic mean.
    Avg,
    /// Sample standard deviation.
    Stdev,
    /// Population standard deviation.
    Stdevp,
    /// Sample variance.
    Var,
    /// Population variance.
    Varp,
}

impl AggregateFunction {
    /// Parses the lowercase query-string name.
    pub fn from_str(src: &str) -> Option<AggregateFunction> {
        match src {
            "count" => Some(AggregateFunction::Count),
            "sum" => Some(AggregateFunction::Sum),
            "avg" => Some(AggregateFunction::Avg),
            "stdev" => Some(AggregateFunction::Stdev),
            "stdevp" => Some(AggregateFunction::Stdevp),
            "var" => Some(AggregateFunction::Var),
            "varp" => Some(AggregateFunction::Varp),
            _ => None,
        }
    }

    /// How many ring elements one row contributes for this function. The
    /// third VAR-family element (the squared value for the sum of squares) is
    /// virtual: it is computed from the value, never fetched as a column.
    pub fn agg_count(self) -> usize {
        match self {
            AggregateFunction::Count | AggregateFunction::Sum => 1,
            AggregateFunction::Avg => 2,
            AggregateFunction::Stdev
            | AggregateFunction::Stdevp
            | AggregateFunction::Var
            | AggregateFunction::Varp => 3,
        }
    }

    /// How many of the elements are projected from SQL (the rest are
    /// virtual).
    pub fn sql_count(self) -> usize {
        match self {
            AggregateFunction::Count | AggregateFunction::Sum => 1,
            _ => 2,
        }
    }

    /// Whether element `i` carries a scaled value (as opposed to a count).
    pub fn should_scale(self, i: usize) -> bool {
        match self {
            AggregateFunction::Count => false,
            AggregateFunction::Sum => true,
            _ => i > 0,
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Stdev => "stdev",
            AggregateFunction::Stdevp => "stdevp",
            AggregateFunction::Var => "var",
            AggregateFunction::Varp => "varp",
        };
        f.write_str(name)
    }
}

/// One requested aggregate: a function applied to a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregate {
    /// The aggregate function.
    pub function: AggregateFunction,
    /// The aggregated column.
    pub column: ColumnId,
}

impl Aggregate {
    /// The data holder that owns the aggregated column.
    pub fn db(&self) -> Party {
        self.column.db
    }

    /// Appends the SQL projection for the non-virtual elements: a null
    /// indicator and/or the null-coalesced value.
    pub fn to_sql(&self, lexicon: &Lexicon, sql: &mut String) {
        let name = &lexicon.column(self.column).name;
        match self.function {
            AggregateFunction::Count => {
                sql.push_str("(CASE WHEN ");
                sql.push_str(name);
                sql.push_str(" IS NULL THEN 0 ELSE 1 END)");
            }
            AggregateFunction::Sum => {
                sql.push_str("(CASE WHEN ");
                sql.push_str(name);
                sql.push_str(" IS NULL THEN 0 ELSE ");
                sql.push_str(name);
                sql.push_str(" END)");
            }
            _ => {
                sql.push_str("(CASE WHEN ");
                sql.push_str(name);
                sql.push_str(" IS NULL THEN 0 ELSE 1 END), (CASE WHEN ");
                sql.push_str(name);
                sql.push_str(" IS NULL THEN 0 ELSE ");
                sql.push_str(name);
                sql.push_str(" END)");
            }
        }
    }

    /// Computes the non-virtual element values for one row, mirroring
    /// [`Aggregate::to_sql`] for sources without a SQL engine.
    pub fn project(&self, value: &SqlValue) -> Vec<SqlValue> {
        let indicator = SqlValue::Int(if value.is_null() { 0 } else { 1 });
        let coalesced = if value.is_null() {
            SqlValue::Int(0)
        } else {
            value.clone()
        };
        match self.function {
            AggregateFunction::Count => vec![indicator],
            AggregateFunction::Sum => vec![coalesced],
            _ => vec![indicator, coalesced],
        }
    }

    /// The fixed-point scale of each decoded element: counts at 0, values at
    /// the column scale, the virtual square at twice the column scale.
    pub fn decode_scales(&self, lexicon: &Lexicon) -> Vec<u32> {
        let s = lexicon.column(self.column).scale;
        match self.function {
            AggregateFunction::Count => vec![0],
            AggregateFunction::Sum => vec![s],
            AggregateFunction::Avg => vec![0, s],
            _ => vec![0, s, 2 * s],
        }
    }

    /// The result-table header, e.g. `sum(incomes.amount)`.
    pub fn label(&self, lexicon: &Lexicon) -> String {
        format!(
            "{}({}.{})",
            self.function,
            lexicon.table(self.db()).name,
            lexicon.column(self.column).name
        )
    }
}

/// Comparison operators allowed in prefilters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    /// `=`
    Eq,
    /// `!=` (also written `<>`)
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl ConditionOperator {
    fn sql(self) -> &'static str {
        match self {
            ConditionOperator::Eq => "=",
            ConditionOperator::Ne => "<>",
            ConditionOperator::Lt => "<",
            ConditionOperator::Le => "<=",
            ConditionOperator::Gt => ">",
            ConditionOperator::Ge => ">=",
        }
    }

    fn holds(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            ConditionOperator::Eq => ord == Equal,
            ConditionOperator::Ne => ord != Equal,
            ConditionOperator::Lt => ord == Less,
            ConditionOperator::Le => ord != Greater,
            ConditionOperator::Gt => ord == Greater,
            ConditionOperator::Ge => ord != Less,
        }
    }
}

/// One `column op literal` comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    /// The filtered column (always local to the prefiltered table).
    pub column: ColumnId,
    /// The comparison operator.
    pub op: ConditionOperator,
    /// The typed literal.
    pub value: SqlValue,
}

/// A per-table prefilter: a conjunction of comparisons.
///
/// The core only ever turns conditions into a WHERE fragment plus bound
/// parameters, or evaluates them against in-memory rows; anything richer is
/// the job of the external query front end.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// The AND-joined comparisons.
    pub comparisons: Vec<Comparison>,
}

impl Condition {
    /// Parses `col op literal [AND col op literal]...` against the columns of
    /// `db`'s table.
    pub fn parse(src: &str, lexicon: &Lexicon, db: Party) -> Result<Condition, QueryError> {
        let mut comparisons = Vec::new();
        for term in split_and(src) {
            let term = term.trim();
            if term.is_empty() {
                return Err(QueryError::QueryString(format!(
                    "empty prefilter term in {src:?}"
                )));
            }
            // Two-character operators must be tried first.
            let ops = [
                ("<=", ConditionOperator::Le),
                (">=", ConditionOperator::Ge),
                ("!=", ConditionOperator::Ne),
                ("<>", ConditionOperator::Ne),
                ("=", ConditionOperator::Eq),
                ("<", ConditionOperator::Lt),
                (">", ConditionOperator::Gt),
            ];
            let (name, op, literal) = ops
                .iter()
                .find_map(|(sym, op)| {
                    term.split_once(sym).map(|(l, r)| (l.trim(), *op, r.trim()))
                })
                .ok_or_else(|| {
                    QueryError::QueryString(format!("no comparison operator in {term:?}"))
                })?;
            let table = lexicon.table(db);
            let (index, column) = table
                .column(name)
                .ok_or_else(|| LexiconError::UnknownColumn(name.to_string()))?;
            let literal = literal
                .strip_prefix('\'')
                .and_then(|l| l.strip_suffix('\''))
                .unwrap_or(literal);
            comparisons.push(Comparison {
                column: ColumnId { db, index },
                op,
                value: typed_literal(column, literal)?,
            });
        }
        if comparisons.is_empty() {
            return Err(QueryError::QueryString("empty prefilter".into()));
        }
        Ok(Condition { comparisons })
    }

    /// Appends ` AND col op ?` fragments and their bound parameters.
    pub fn to_sql(&self, lexicon: &Lexicon, sql: &mut String, params: &mut Vec<SqlValue>) {
        for c in &self.comparisons {
            sql.push_str(" AND ");
            sql.push_str(&lexicon.column(c.column).name);
            sql.push(' ');
            sql.push_str(c.op.sql());
            sql.push_str(" ?");
            params.push(c.value.clone());
        }
    }

    /// Evaluates the condition against one row's column values. Null and
    /// type-incompatible comparisons are false, as in SQL.
    pub fn matches(&self, lexicon: &Lexicon, value_of: impl Fn(&str) -> SqlValue) -> bool {
        self.comparisons.iter().all(|c| {
            let v = value_of(&lexicon.column(c.column).name);
            v.compare(&c.value).is_some_and(|ord| c.op.holds(ord))
        })
    }
}

/// Splits on top-level case-insensitive ` AND `.
fn split_and(src: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut rest = src;
    loop {
        let lower = rest.to_ascii_lowercase();
        match lower.find(" and ") {
            Some(i) => {
                terms.push(&rest[..i]);
                rest = &rest[i + 5..];
            }
            None => {
                terms.push(rest);
                return terms;
            }
        }
    }
}

/// Types a raw literal according to the column it binds to.
pub fn typed_literal(column: &Column, raw: &str) -> Result<SqlValue, QueryError> {
    let err = || QueryError::BadLiteral {
        column: column.name.clone(),
        literal: raw.to_string(),
    };
    match column.ty {
        ColumnType::Int => Ok(SqlValue::Int(raw.parse().map_err(|_| err())?)),
        ColumnType::Decimal => {
            let d: Decimal = raw.parse().map_err(|_| err())?;
            Ok(SqlValue::Dec(d))
        }
        ColumnType::String => Ok(SqlValue::Text(raw.to_string())),
    }
}

/// An immutable, fully resolved query.
#[derive(Debug, Clone)]
pub struct Query {
    lexicon: Arc<Lexicon>,
    text: String,
    aggregates: Vec<Aggregate>,
    group_bys: Vec<ColumnId>,
    prefilters: BTreeMap<Party, Condition>,
    agg_counts: [usize; 2],
}

impl Query {
    /// Parses a query string of `aggregate=fun:col`, `group_by=col` and
    /// `prefilter=table:cond` terms against the lexicon.
    pub fn parse(text: &str, lexicon: Arc<Lexicon>) -> Result<Query, QueryError> {
        let mut aggregates = Vec::new();
        let mut group_bys = Vec::new();
        let mut prefilters = BTreeMap::new();
        for term in text.split('&') {
            if term.is_empty() {
                continue;
            }
            let (key, value) = term.split_once('=').ok_or_else(|| {
                QueryError::QueryString(format!("parameter must have an argument: {term:?}"))
            })?;
            let key = percent_decode(key)?;
            let value = percent_decode(value)?;
            match key.as_str() {
                "aggregate" => {
                    let (fun, col) = value.split_once(':').ok_or_else(|| {
                        QueryError::QueryString(format!(
                            "aggregate argument must contain a colon: {value:?}"
                        ))
                    })?;
                    let function = AggregateFunction::from_str(fun).ok_or_else(|| {
                        QueryError::QueryString(format!("unknown aggregate function: {fun:?}"))
                    })?;
                    let column = lexicon.find_column(col)?;
                    aggregates.push(Aggregate { function, column });
                }
                "group_by" => {
                    let column = lexicon.find_column(&value)?;
                    if lexicon.column(column).domain.is_none() {
                        return Err(QueryError::QueryString(format!(
                            "column cannot be grouped by, it has no domain: {value:?}"
                        )));
                    }
                    group_bys.push(column);
                }
                "prefilter" => {
                    let (table, cond) = value.split_once(':').ok_or_else(|| {
                        QueryError::QueryString(format!(
                            "prefilter argument must contain a colon: {value:?}"
                        ))
                    })?;
                    let db = lexicon.find_table(table)?;
                    let condition = Condition::parse(cond, &lexicon, db)?;
                    if prefilters.insert(db, condition).is_some() {
                        return Err(QueryError::QueryString(format!(
                            "table already has a prefilter: {table:?}"
                        )));
                    }
                }
                other => {
                    return Err(QueryError::QueryString(format!(
                        "unknown parameter: {other:?}"
                    )));
                }
            }
        }
        if aggregates.is_empty() {
            return Err(QueryError::QueryString(
                "at least one aggregate is required".into(),
            ));
        }
        if group_bys.is_empty() {
            return Err(QueryError::QueryString(
                "at least one group_by is required".into(),
            ));
        }
        let mut agg_counts = [0usize; 2];
        for a in &aggregates {
            agg_counts[a.db().db_index()] += a.function.agg_count();
        }
        let query = Query {
            lexicon,
            text: text.to_string(),
            aggregates,
            group_bys,
            prefilters,
            agg_counts,
        };
        query.tuple_count()?; // overflow is a configuration error
        Ok(query)
    }

    /// The source query string, forwarded verbatim on the wire.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The lexicon this query was resolved against.
    pub fn lexicon(&self) -> &Arc<Lexicon> {
        &self.lexicon
    }

    /// All aggregates, in request order.
    pub fn aggregates(&self) -> &[Aggregate] {
        &self.aggregates
    }

    /// The aggregates owned by one data holder, in request order.
    pub fn aggregates_for(&self, db: Party) -> impl Iterator<Item = &Aggregate> {
        self.aggregates.iter().filter(move |a| a.db() == db)
    }

    /// The ordered group-by columns.
    pub fn group_bys(&self) -> &[ColumnId] {
        &self.group_bys
    }

    /// The prefilter for one data holder, if any.
    pub fn prefilter(&self, db: Party) -> Option<&Condition> {
        self.prefilters.get(&db)
    }

    /// Total ring elements per row for one data holder.
    pub fn agg_count(&self, db: Party) -> usize {
        self.agg_counts[db.db_index()]
    }

    /// The number of domain tuples, i.e. the product of the group-by domain
    /// sizes.
    pub fn tuple_count(&self) -> Result<u32, QueryError> {
        let mut n: u64 = 1;
        for c in &self.group_bys {
            let d = self.lexicon.column(*c).domain.as_ref();
            let len = d.map(|d| d.len()).unwrap_or(0) as u64;
            n = n.checked_mul(len).ok_or(QueryError::TooManyTuples)?;
            if n > i32::MAX as u64 {
                return Err(QueryError::TooManyTuples);
            }
        }
        Ok(n as u32)
    }

    /// The typed domain value of a group-by column at a domain index.
    pub fn domain_value(&self, column: ColumnId, i: usize) -> Result<SqlValue, QueryError> {
        let col = self.lexicon.column(column);
        let raw = &col.domain.as_ref().expect("group-by columns have domains")[i];
        typed_literal(col, raw)
    }
}

/// Decodes `%XX` escapes and `+` spaces.
fn percent_decode(src: &str) -> Result<String, QueryError> {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| {
                        QueryError::QueryString(format!("bad percent escape in {src:?}"))
                    })?;
                out.push(hex);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out)
        .map_err(|_| QueryError::QueryString(format!("escapes are not UTF-8 in {src:?}")))
}
