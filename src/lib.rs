//! A three-party engine for aggregate SQL over a private equijoin.
//!
//! Two data holders each own one table; a coordinator answers aggregate
//! queries (COUNT, SUM, AVG and the variance family) over the join of the
//! two tables on a shared linking column, grouped by columns with declared
//! domains, without either holder revealing its rows to anyone and without
//! the coordinator learning more than the published aggregates and the
//! linking keys of candidate rows.
//!
//! ## How a query runs
//!
//! The coordinator opens three streams per holder. Per group-by tuple, each
//! holder counts and selects its matching rows ordered by the linking
//! column, masks every projected value with a one-time additive mask shared
//! with the other holder, and streams the masked rows up (S1). The other
//! holder turns each mask into a fresh blind and a running cross term (S2
//! and the holder duplex). The coordinator joins the two sorted streams,
//! sends each holder its per-row match counts minus the blinds (S3), and
//! combines the returned dot-product shares into exact column sums over the
//! join, from which the aggregates are computed in fixed-point decimal
//! arithmetic.
//!
//! All values live in the ring of integers modulo the lexicon's modulus;
//! the engine picks the narrowest machine representation (`u32`, `u64` or a
//! big integer) that fits. See [`ring::select_ring`].
//!
//! ## Main components
//!
//! * [`lexicon`]: the shared schema both holders and the coordinator must
//!   agree on, byte for byte.
//! * [`query::Query`]: the parsed query-string form of a request.
//! * [`server::PhNode`] and [`server::DbNode`]: the long-running nodes.
//! * [`source::RowSource`]: the seam to the holders' databases, with an
//!   in-memory implementation for tests and embeddings.
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod decimal;
pub mod domain;
pub mod lexicon;
pub mod merge;
pub mod party;
pub mod pool;
pub mod proto;
pub mod query;
pub mod result;
pub mod ring;
pub mod server;
pub mod source;
pub mod sql;
pub mod state;
pub mod wire;
