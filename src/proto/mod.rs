//! The three-party aggregation protocol.
//!
//! A query runs as a fixed set of cooperating handlers, one per connection:
//!
//! - On the coordinator, per data holder: an S1 reader (row counts, masked
//!   shares and the cross term), an S2 reader (blinds for the *other*
//!   holder's rows) and an S3 writer/reader (blinded indicators down, the
//!   dot-product share back up). A merge task joins the six streams.
//! - On each data holder: S1, S2 and S3 handlers serving the coordinator,
//!   plus the two halves of the holder-to-holder duplex (SH sends the local
//!   row count and one mask row per local row; RH receives the peer's and
//!   turns each peer mask row into a blind and the running cross term).
//!
//! Handlers exchange data over bounded queues and advance through the domain
//! in lock step; a count that disagrees between two routes is a protocol
//! violation and kills the query. Every handler flushes its connection
//! before blocking on a queue so buffered frames can never deadlock the
//! pipeline.

use std::sync::Arc;

use num_bigint::BigInt;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

use crate::party::Party;
use crate::query::{AggregateFunction, Query, QueryError};
use crate::ring::Ring;
use crate::source::SourceError;
use crate::sql::SqlValue;
use crate::state::{Activity, Tasks, Tracked};
use crate::wire::{ReadConn, WireError, WriteConn};

pub mod db;
pub mod duplex;
pub mod ph;

/// Handlers that must release a coordinator-side query record: two S1, two
/// S2, two S3 drivers (the merge task runs inline with the caller).
pub const PH_RELEASES: usize = 6;

/// Handlers that must release a data-holder query record: S1, S2, S3 and the
/// duplex.
pub const DB_RELEASES: usize = 4;

/// A protocol-level failure. Fatal for the whole query.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The connection failed or carried malformed frames.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The database layer failed.
    #[error(transparent)]
    Source(#[from] SourceError),
    /// The query text did not parse or validate.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// Two routes disagreed about the data, or a stream arrived out of
    /// order.
    #[error("protocol violation: {0}")]
    Violation(String),
    /// A sibling handler of the same query is gone.
    #[error("query aborted: {0} handler is gone")]
    Closed(&'static str),
}

pub(crate) fn violation(msg: impl Into<String>) -> ProtoError {
    ProtoError::Violation(msg.into())
}

/// One masked row travelling up an S1 stream: the plaintext linking key and
/// the masked share of each element.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedRow<R: Ring> {
    /// The linking column bytes.
    pub link: Vec<u8>,
    /// `x + r` for each of the holder's elements.
    pub elems: Vec<R::Elem>,
}

/// What a coordinator S1 reader relays to the merge, in stream order.
#[derive(Debug)]
pub enum S1Event<R: Ring> {
    /// The holder's own row count and its view of the peer's.
    Counts {
        /// Rows the sending holder selected for the tuple.
        local: u64,
        /// Rows it heard the other holder selected.
        peer: u64,
    },
    /// A batch of masked rows.
    Rows(Vec<MaskedRow<R>>),
    /// The cross term for the *other* holder's rows, after all rows.
    Cross(Vec<R::Elem>),
}

/// What an S2 stream carries: how many blinds, then the blinds.
#[derive(Debug)]
pub enum BlindEvent<R: Ring> {
    /// Blinds that will follow for this tuple (zero when the tuple is
    /// skipped).
    Count(u64),
    /// A batch of per-row blinds.
    Blinds(Vec<R::Elem>),
}

/// Merge-to-S3-driver commands for one data holder.
#[derive(Debug)]
pub enum S3Cmd<R: Ring> {
    /// A batch of blinded match indicators, in the holder's row order.
    Yb(Vec<R::Elem>),
    /// The tuple's indicators are complete: flush and read the share back.
    Finish {
        /// Elements expected in the returned share.
        expect: usize,
    },
}

/// What a data-holder S1 handler queues for its S3 sibling.
#[derive(Debug)]
pub enum S3Feed<R: Ring> {
    /// A new domain tuple with both row counts.
    Tuple {
        /// Rows selected locally.
        local: u64,
        /// Rows the peer selected.
        peer: u64,
    },
    /// One plaintext local row (elements only, in link order).
    Row(Vec<R::Elem>),
}

/// Receives from a bounded queue, treating closure as a dead sibling.
pub(crate) async fn recv_from<T>(
    rx: &mut mpsc::Receiver<T>,
    from: &'static str,
) -> Result<T, ProtoError> {
    rx.recv().await.ok_or(ProtoError::Closed(from))
}

/// Sends to a bounded queue, flushing the connection first if the queue
/// would make us block with frames still sitting in the write buffer.
pub(crate) async fn send_flushing<T>(
    w: &mut WriteConn,
    tx: &mpsc::Sender<T>,
    item: T,
    to: &'static str,
) -> Result<(), ProtoError> {
    match tx.try_send(item) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(item)) => {
            w.flush().await?;
            tx.send(item).await.map_err(|_| ProtoError::Closed(to))
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Err(ProtoError::Closed(to)),
    }
}

/// Sends to a bounded queue with no connection to flush.
pub(crate) async fn send_to<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    to: &'static str,
) -> Result<(), ProtoError> {
    tx.send(item).await.map_err(|_| ProtoError::Closed(to))
}

/// Writes a batch of masked rows: an i32 row count, then per row the fixed
/// width link followed by the elements.
pub(crate) async fn write_masked_rows<R: Ring>(
    w: &mut WriteConn,
    ring: &R,
    rows: &[MaskedRow<R>],
    scratch: &mut Vec<u8>,
) -> Result<(), WireError> {
    let n = i32::try_from(rows.len())
        .map_err(|_| WireError::BadFrame("row batch too large".into()))?;
    w.write_i32(n).await?;
    scratch.clear();
    for row in rows {
        scratch.extend_from_slice(&row.link);
        for e in &row.elems {
            ring.write_elem(e, scratch);
        }
    }
    w.write_raw(scratch).await
}

/// Reads a batch of masked rows with `elems` elements after a `link_size`
/// byte key each. An empty batch is a protocol violation (it could spin
/// forever).
pub(crate) async fn read_masked_rows<R: Ring>(
    r: &mut ReadConn,
    ring: &R,
    link_size: usize,
    elems: usize,
    scratch: &mut Vec<u8>,
) -> Result<Vec<MaskedRow<R>>, ProtoError> {
    let n = r.read_i32().await?;
    if n <= 0 {
        return Err(violation(format!("row batch of {n}")));
    }
    let row_width = link_size + elems * ring.elem_size();
    scratch.clear();
    scratch.resize(n as usize * row_width, 0);
    r.read_raw(scratch).await?;
    let mut rows = Vec::with_capacity(n as usize);
    for chunk in scratch.chunks_exact(row_width) {
        let mut row = MaskedRow {
            link: chunk[..link_size].to_vec(),
            elems: Vec::with_capacity(elems),
        };
        for elem in chunk[link_size..].chunks_exact(ring.elem_size()) {
            row.elems.push(
                ring.read_elem(elem)
                    .map_err(|e| WireError::BadFrame(e.to_string()))?,
            );
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Writes a batch of element-only rows (mask rows on the duplex).
pub(crate) async fn write_elem_rows<R: Ring>(
    w: &mut WriteConn,
    ring: &R,
    rows: &[Vec<R::Elem>],
    scratch: &mut Vec<u8>,
) -> Result<(), WireError> {
    let n = i32::try_from(rows.len())
        .map_err(|_| WireError::BadFrame("row batch too large".into()))?;
    w.write_i32(n).await?;
    scratch.clear();
    for row in rows {
        for e in row {
            ring.write_elem(e, scratch);
        }
    }
    w.write_raw(scratch).await
}

/// Reads a batch written by [`write_elem_rows`].
pub(crate) async fn read_elem_rows<R: Ring>(
    r: &mut ReadConn,
    ring: &R,
    elems: usize,
    scratch: &mut Vec<u8>,
) -> Result<Vec<Vec<R::Elem>>, ProtoError> {
    let n = r.read_i32().await?;
    if n <= 0 {
        return Err(violation(format!("row batch of {n}")));
    }
    let row_width = elems * ring.elem_size();
    if row_width == 0 {
        // A holder with no local aggregates still sends one (empty) mask row
        // per selected row, so the row counts keep the streams in lock step.
        return Ok(vec![Vec::new(); n as usize]);
    }
    scratch.clear();
    scratch.resize(n as usize * row_width, 0);
    r.read_raw(scratch).await?;
    let mut rows = Vec::with_capacity(n as usize);
    for chunk in scratch.chunks_exact(row_width) {
        let mut row = Vec::with_capacity(elems);
        for elem in chunk.chunks_exact(ring.elem_size()) {
            row.push(
                ring.read_elem(elem)
                    .map_err(|e| WireError::BadFrame(e.to_string()))?,
            );
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Encodes one selected row into ring elements, appending the virtual
/// squared element for the variance family. `values` holds the SQL
/// projections in aggregate order.
pub(crate) fn encode_row<R: Ring>(
    ring: &R,
    query: &Query,
    db: Party,
    values: &[SqlValue],
) -> Result<Vec<R::Elem>, ProtoError> {
    let mut out = Vec::with_capacity(query.agg_count(db));
    let mut next = 0;
    for aggregate in query.aggregates_for(db) {
        let scales = aggregate.decode_scales(query.lexicon());
        let taken = &values[next..next + aggregate.function.sql_count()];
        next += aggregate.function.sql_count();
        match aggregate.function {
            AggregateFunction::Count | AggregateFunction::Sum => {
                out.push(ring.encode(&unscaled(&taken[0], scales[0])?));
            }
            AggregateFunction::Avg => {
                out.push(ring.encode(&unscaled(&taken[0], scales[0])?));
                out.push(ring.encode(&unscaled(&taken[1], scales[1])?));
            }
            _ => {
                let value = unscaled(&taken[1], scales[1])?;
                out.push(ring.encode(&unscaled(&taken[0], scales[0])?));
                out.push(ring.encode(&value));
                out.push(ring.encode(&(&value * &value)));
            }
        }
    }
    if next != values.len() {
        return Err(violation(format!(
            "row has {} projected values, expected {next}",
            values.len()
        )));
    }
    Ok(out)
}

fn unscaled(value: &SqlValue, scale: u32) -> Result<BigInt, ProtoError> {
    let d = value
        .to_decimal()
        .ok_or_else(|| violation(format!("non-numeric aggregated value {value}")))?;
    Ok(d.rescale(scale).unscaled().clone())
}

/// Coordinator-side shared query record; the channels are wired directly
/// between the driver tasks, so this only carries lifecycle state.
pub struct PhShared {
    activity: Activity,
    tasks: Tasks,
}

impl PhShared {
    /// A fresh record.
    pub fn new() -> PhShared {
        PhShared {
            activity: Activity::default(),
            tasks: Tasks::default(),
        }
    }
}

impl Default for PhShared {
    fn default() -> PhShared {
        PhShared::new()
    }
}

impl Tracked for PhShared {
    fn activity(&self) -> &Activity {
        &self.activity
    }

    fn tasks(&self) -> &Tasks {
        &self.tasks
    }
}

/// Endpoints the data-holder S1 handler takes.
pub struct S1Ends<R: Ring> {
    /// Local row count, for the duplex send half.
    pub count_to_sh: mpsc::Sender<u64>,
    /// Local row count, for the duplex receive half.
    pub count_to_rh: mpsc::Sender<u64>,
    /// The peer's row count, from the duplex receive half.
    pub peer_count: mpsc::Receiver<u64>,
    /// One mask row per local row, from the duplex send half.
    pub masks: mpsc::Receiver<Vec<R::Elem>>,
    /// The per-tuple cross term, from the duplex receive half.
    pub cross: mpsc::Receiver<Vec<R::Elem>>,
    /// Counts and plaintext rows for the S3 handler.
    pub to_s3: mpsc::Sender<S3Feed<R>>,
}

/// Endpoints the data-holder S2 handler takes.
pub struct S2Ends<R: Ring> {
    /// Blind counts and batches, from the duplex receive half.
    pub blinds: mpsc::Receiver<BlindEvent<R>>,
}

/// Endpoints the data-holder S3 handler takes.
pub struct S3Ends<R: Ring> {
    /// Counts and plaintext rows, from the S1 handler.
    pub feed: mpsc::Receiver<S3Feed<R>>,
}

/// Endpoints the duplex send half takes.
pub struct ShEnds<R: Ring> {
    /// Local row count, from the S1 handler.
    pub local_count: mpsc::Receiver<u64>,
    /// The peer's row count, from the receive half.
    pub peer_count: mpsc::Receiver<u64>,
    /// Mask rows for the S1 handler.
    pub masks_to_s1: mpsc::Sender<Vec<R::Elem>>,
}

/// Endpoints the duplex receive half takes.
pub struct RhEnds<R: Ring> {
    /// Local row count, from the S1 handler.
    pub local_count: mpsc::Receiver<u64>,
    /// Peer count fan-out.
    pub peer_count_to_s1: mpsc::Sender<u64>,
    /// Peer count fan-out.
    pub peer_count_to_sh: mpsc::Sender<u64>,
    /// Blinds for the S2 handler.
    pub blinds_to_s2: mpsc::Sender<BlindEvent<R>>,
    /// The cross term for the S1 handler.
    pub cross_to_s1: mpsc::Sender<Vec<R::Elem>>,
}

struct DbEnds<R: Ring> {
    s1: Option<S1Ends<R>>,
    s2: Option<S2Ends<R>>,
    s3: Option<S3Ends<R>>,
    sh: Option<ShEnds<R>>,
    rh: Option<RhEnds<R>>,
}

/// Data-holder-side shared query record. Created by whichever connection's
/// handler arrives first; each handler takes its channel endpoints exactly
/// once.
pub struct DbShared<R: Ring> {
    /// The parsed query.
    pub query: Arc<Query>,
    /// The ring selected by the lexicon modulus.
    pub ring: R,
    activity: Activity,
    tasks: Tasks,
    ends: Mutex<DbEnds<R>>,
}

impl<R: Ring> DbShared<R> {
    /// Builds the record and all inter-handler queues.
    pub fn new(query: Arc<Query>, ring: R, queue_capacity: usize) -> DbShared<R> {
        let (count_to_sh_tx, count_to_sh_rx) = mpsc::channel(queue_capacity);
        let (count_to_rh_tx, count_to_rh_rx) = mpsc::channel(queue_capacity);
        let (peer_to_s1_tx, peer_to_s1_rx) = mpsc::channel(queue_capacity);
        let (peer_to_sh_tx, peer_to_sh_rx) = mpsc::channel(queue_capacity);
        let (masks_tx, masks_rx) = mpsc::channel(queue_capacity);
        let (cross_tx, cross_rx) = mpsc::channel(queue_capacity);
        let (blinds_tx, blinds_rx) = mpsc::channel(queue_capacity);
        let (feed_tx, feed_rx) = mpsc::channel(queue_capacity);
        DbShared {
            query,
            ring,
            activity: Activity::default(),
            tasks: Tasks::default(),
            ends: Mutex::new(DbEnds {
                s1: Some(S1Ends {
                    count_to_sh: count_to_sh_tx,
                    count_to_rh: count_to_rh_tx,
                    peer_count: peer_to_s1_rx,
                    masks: masks_rx,
                    cross: cross_rx,
                    to_s3: feed_tx,
                }),
                s2: Some(S2Ends { blinds: blinds_rx }),
                s3: Some(S3Ends { feed: feed_rx }),
                sh: Some(ShEnds {
                    local_count: count_to_sh_rx,
                    peer_count: peer_to_sh_rx,
                    masks_to_s1: masks_tx,
                }),
                rh: Some(RhEnds {
                    local_count: count_to_rh_rx,
                    peer_count_to_s1: peer_to_s1_tx,
                    peer_count_to_sh: peer_to_sh_tx,
                    blinds_to_s2: blinds_tx,
                    cross_to_s1: cross_tx,
                }),
            }),
        }
    }

    /// Takes the S1 endpoints. A second take means the coordinator opened
    /// the same stream twice.
    pub async fn take_s1(&self) -> Result<S1Ends<R>, ProtoError> {
        self.ends
            .lock()
            .await
            .s1
            .take()
            .ok_or_else(|| violation("duplicate S1 stream"))
    }

    /// Takes the S2 endpoints.
    pub async fn take_s2(&self) -> Result<S2Ends<R>, ProtoError> {
        self.ends
            .lock()
            .await
            .s2
            .take()
            .ok_or_else(|| violation("duplicate S2 stream"))
    }

    /// Takes the S3 endpoints.
    pub async fn take_s3(&self) -> Result<S3Ends<R>, ProtoError> {
        self.ends
            .lock()
            .await
            .s3
            .take()
            .ok_or_else(|| violation("duplicate S3 stream"))
    }

    /// Takes the duplex send-half endpoints.
    pub async fn take_sh(&self) -> Result<ShEnds<R>, ProtoError> {
        self.ends
            .lock()
            .await
            .sh
            .take()
            .ok_or_else(|| violation("duplicate duplex stream"))
    }

    /// Takes the duplex receive-half endpoints.
    pub async fn take_rh(&self) -> Result<RhEnds<R>, ProtoError> {
        self.ends
            .lock()
            .await
            .rh
            .take()
            .ok_or_else(|| violation("duplicate duplex stream"))
    }
}

impl<R: Ring> Tracked for DbShared<R> {
    fn activity(&self) -> &Activity {
        &self.activity
    }

    fn tasks(&self) -> &Tasks {
        &self.tasks
    }
}
