//! Odometer enumeration of the group-by domain product.
//!
//! Every per-query handler constructs its own iterator from the same query
//! text and advances it once per tuple. No tuple identifier is ever
//! transmitted: the enumeration position is the only synchronization key
//! between the fourteen handlers of a query, so all instances must produce
//! the exact same order — last column fastest.

use std::sync::Arc;

use crate::party::Party;
use crate::query::{Query, QueryError};
use crate::sql::SqlValue;

/// Iterates all group-by value combinations in odometer order.
pub struct DomainIterator {
    query: Arc<Query>,
    /// Indices of the group-by columns owned by the local party.
    my_group_bys: Vec<usize>,
    positions: Vec<usize>,
    count: u32,
    started: bool,
    done: bool,
    index: u32,
}

impl DomainIterator {
    /// Builds an iterator over `query`'s group-by domains. `local` selects
    /// which columns [`DomainIterator::to_sql`] and
    /// [`DomainIterator::next_local`] bind (PH owns none).
    pub fn new(query: Arc<Query>, local: Party) -> Result<DomainIterator, QueryError> {
        let count = query.tuple_count()?;
        let my_group_bys = query
            .group_bys()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.db == local)
            .map(|(i, _)| i)
            .collect();
        let positions = vec![0; query.group_bys().len()];
        Ok(DomainIterator {
            query,
            my_group_bys,
            positions,
            count,
            started: false,
            done: false,
            index: 0,
        })
    }

    /// Total number of tuples.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// The zero-based position of the current tuple.
    pub fn index(&self) -> u32 {
        debug_assert!(self.started && !self.done);
        self.index
    }

    /// Advances to the next tuple. Returns `false` once exhausted and stays
    /// exhausted from then on.
    pub fn next(&mut self) -> bool {
        if self.done {
            return false;
        }
        if !self.started {
            self.started = true;
            return true;
        }
        let lexicon = self.query.lexicon();
        for i in (0..self.positions.len()).rev() {
            let column = self.query.group_bys()[i];
            let size = lexicon
                .column(column)
                .domain
                .as_ref()
                .expect("group-by columns have domains")
                .len();
            self.positions[i] += 1;
            if self.positions[i] < size {
                self.index += 1;
                return true;
            }
            self.positions[i] = 0;
            if i == 0 {
                self.done = true;
                return false;
            }
        }
        unreachable!("queries have at least one group-by column")
    }

    /// Advances and rewrites `params` with the local party's domain values in
    /// column order.
    pub fn next_local(&mut self, params: &mut Vec<SqlValue>) -> Result<bool, QueryError> {
        if !self.next() {
            return Ok(false);
        }
        params.clear();
        for &i in &self.my_group_bys {
            let column = self.query.group_bys()[i];
            params.push(self.query.domain_value(column, self.positions[i])?);
        }
        Ok(true)
    }

    /// Appends ` AND col = ?` predicates and parameters for the local
    /// columns only; the other party's group-bys are irrelevant to a local
    /// SQL query.
    pub fn to_sql(&self, sql: &mut String, params: &mut Vec<SqlValue>) -> Result<(), QueryError> {
        let lexicon = self.query.lexicon();
        for &i in &self.my_group_bys {
            let column = self.query.group_bys()[i];
            sql.push_str(" AND ");
            sql.push_str(&lexicon.column(column).name);
            sql.push_str(" = ?");
            params.push(self.query.domain_value(column, self.positions[i])?);
        }
        Ok(())
    }

    /// The full current tuple, one value per group-by column (used at PH to
    /// label result rows).
    pub fn current(&self) -> Result<Vec<SqlValue>, QueryError> {
        debug_assert!(self.started && !self.done);
        self.query
            .group_bys()
            .iter()
            .zip(&self.positions)
            .map(|(&column, &pos)| self.query.domain_value(column, pos))
            .collect()
    }
}
