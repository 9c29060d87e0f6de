//! The shared schema ("lexicon") all three parties must agree on.
//!
//! The lexicon is exchanged during the connection handshake as canonical JSON
//! text and compared for byte equality: a mismatch is fatal for the
//! connection. Canonical means ordered maps throughout, so two lexicons that
//! are structurally equal always serialize identically.

use std::collections::BTreeMap;
use std::fmt;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::party::Party;

/// Errors raised while resolving names against the lexicon.
#[derive(Debug, PartialEq, Eq)]
pub enum LexiconError {
    /// The named column does not exist in any table.
    UnknownColumn(String),
    /// The bare column name exists in both tables.
    AmbiguousColumn(String),
    /// The named table does not exist.
    UnknownTable(String),
    /// The lexicon is structurally invalid.
    Invalid(String),
}

impl fmt::Display for LexiconError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexiconError::UnknownColumn(name) => write!(f, "unknown column: {name:?}"),
            LexiconError::AmbiguousColumn(name) => {
                write!(f, "column name is ambiguous between the tables: {name:?}")
            }
            LexiconError::UnknownTable(name) => write!(f, "unknown table: {name:?}"),
            LexiconError::Invalid(reason) => write!(f, "invalid lexicon: {reason}"),
        }
    }
}

impl std::error::Error for LexiconError {}

/// The value domain of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Whole numbers.
    Int,
    /// Fixed-point numbers with the column's scale.
    Decimal,
    /// Opaque text.
    String,
}

fn default_scale() -> u32 {
    0
}

/// One column of a data holder's table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name as used in queries and generated SQL.
    pub name: String,
    /// Value type.
    #[serde(rename = "type")]
    pub ty: ColumnType,
    /// Fixed-point scale applied when encoding values into the ring.
    #[serde(default = "default_scale")]
    pub scale: u32,
    /// The closed list of legal values, required for group-by columns.
    #[serde(default)]
    pub domain: Option<Vec<String>>,
}

/// One data holder's table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Table name as used in queries and generated SQL.
    pub name: String,
    /// The private join key column. Never revealed; compared only as
    /// fixed-width bytes.
    pub linking_column: String,
    /// All queryable columns, in declaration order.
    pub columns: Vec<Column>,
}

impl Table {
    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<(usize, &Column)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == name)
    }
}

fn default_linking_column_size() -> u32 {
    8
}

fn default_guid_size() -> u32 {
    16
}

/// Deployment-wide constants shared by the whole lexicon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LexiconCommon {
    /// The ring modulus, as a decimal string.
    pub modulus: String,
    /// Fixed byte width of the linking column on the wire.
    #[serde(default = "default_linking_column_size")]
    pub linking_column_size: u32,
    /// Byte width of query ids.
    #[serde(default = "default_guid_size")]
    pub guid_size: u32,
}

/// A column fully resolved against the lexicon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnId {
    /// The data holder owning the column.
    pub db: Party,
    /// Index into the owning table's column list.
    pub index: usize,
}

/// The shared schema: per-DB tables plus the common constants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lexicon {
    /// Deployment-wide constants.
    pub common: LexiconCommon,
    /// One table per data holder.
    pub dbs: BTreeMap<Party, Table>,
}

impl Lexicon {
    /// Validates structural invariants after deserialization.
    pub fn validate(&self) -> Result<(), LexiconError> {
        let modulus = self.modulus();
        if modulus.is_none() {
            return Err(LexiconError::Invalid(format!(
                "modulus is not a positive integer: {:?}",
                self.common.modulus
            )));
        }
        if self.common.linking_column_size == 0 {
            return Err(LexiconError::Invalid(
                "linking_column_size must be positive".into(),
            ));
        }
        if self.common.guid_size == 0 {
            return Err(LexiconError::Invalid("guid_size must be positive".into()));
        }
        for db in Party::DBS {
            let table = self
                .dbs
                .get(&db)
                .ok_or_else(|| LexiconError::Invalid(format!("missing table for {db}")))?;
            if table.column(&table.linking_column).is_none() {
                return Err(LexiconError::Invalid(format!(
                    "table {:?} does not contain its linking column {:?}",
                    table.name, table.linking_column
                )));
            }
            if let Some(empty) = table
                .columns
                .iter()
                .find(|c| c.domain.as_ref().is_some_and(|d| d.is_empty()))
            {
                return Err(LexiconError::Invalid(format!(
                    "column {:?} has an empty domain",
                    empty.name
                )));
            }
        }
        Ok(())
    }

    /// The configured ring modulus, or `None` if the string is malformed.
    pub fn modulus(&self) -> Option<BigUint> {
        let m: BigUint = self.common.modulus.parse().ok()?;
        if m.bits() == 0 { None } else { Some(m) }
    }

    /// The table of the given data holder.
    pub fn table(&self, db: Party) -> &Table {
        &self.dbs[&db]
    }

    /// Resolves a column id back to its definition.
    pub fn column(&self, id: ColumnId) -> &Column {
        &self.table(id.db).columns[id.index]
    }

    /// Resolves `table.column` or a bare column name. Bare names must be
    /// unique across both tables.
    pub fn find_column(&self, name: &str) -> Result<ColumnId, LexiconError> {
        if let Some((table_name, column_name)) = name.split_once('.') {
            let db = self.find_table(table_name)?;
            let (index, _) = self
                .table(db)
                .column(column_name)
                .ok_or_else(|| LexiconError::UnknownColumn(name.to_string()))?;
            return Ok(ColumnId { db, index });
        }
        let mut found = None;
        for db in Party::DBS {
            if let Some((index, _)) = self.table(db).column(name) {
                if found.is_some() {
                    return Err(LexiconError::AmbiguousColumn(name.to_string()));
                }
                found = Some(ColumnId { db, index });
            }
        }
        found.ok_or_else(|| LexiconError::UnknownColumn(name.to_string()))
    }

    /// Resolves a table name to its owning data holder.
    pub fn find_table(&self, name: &str) -> Result<Party, LexiconError> {
        Party::DBS
            .into_iter()
            .find(|db| self.table(*db).name == name)
            .ok_or_else(|| LexiconError::UnknownTable(name.to_string()))
    }

    /// The canonical handshake text. Equal lexicons always produce
    /// byte-identical text.
    pub fn canonical_text(&self) -> String {
        serde_json::to_string(self).expect("the lexicon always serializes")
    }
}
