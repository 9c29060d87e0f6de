//! Data-holder-side stream handlers.
//!
//! All three advance through the domain in lock step with the coordinator
//! and the duplex halves. The S1 handler owns the database work: it counts
//! and selects per tuple, masks each row with the mask generated by the
//! duplex send half, and feeds the plaintext elements to its S3 sibling over
//! a bounded queue.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

use crate::domain::DomainIterator;
use crate::party::Party;
use crate::ring::Ring;
use crate::source::{RowCursor, RowPlan, RowSource};
use crate::state::Tracked;
use crate::wire::Conn;

use super::{
    BlindEvent, DbShared, MaskedRow, ProtoError, S3Feed, recv_from, send_flushing, send_to,
    violation, write_masked_rows,
};

/// Serves the S1 stream for `local`: per tuple the counts, then the masked
/// rows in linking order, then the cross term relayed from the duplex
/// receive half.
pub async fn run_s1<R: Ring, S: RowSource>(
    conn: &mut Conn,
    shared: &DbShared<R>,
    source: &S,
    local: Party,
    batch_size: usize,
) -> Result<(), ProtoError> {
    let mut ends = shared.take_s1().await?;
    let query = &shared.query;
    let ring = &shared.ring;
    let k = query.agg_count(local);
    let link_size = query.lexicon().common.linking_column_size as usize;
    let mut domain = DomainIterator::new(Arc::clone(query), local)?;
    let mut scratch = Vec::new();
    while domain.next() {
        let count_plan = RowPlan::count(query, local, &domain)?;
        let local_n = source.count(&count_plan).await?;
        send_to(&ends.count_to_sh, local_n, "duplex send").await?;
        send_to(&ends.count_to_rh, local_n, "duplex receive").await?;
        let peer_n = recv_from(&mut ends.peer_count, "duplex receive").await?;
        trace!(tuple = domain.index(), local_n, peer_n, "s1 counts");
        conn.writer().write_i64(local_n as i64).await?;
        conn.writer().write_i64(peer_n as i64).await?;
        conn.flush().await?;
        send_flushing(
            conn.writer(),
            &ends.to_s3,
            S3Feed::Tuple {
                local: local_n,
                peer: peer_n,
            },
            "s3",
        )
        .await?;
        shared.activity().touch();
        if local_n == 0 || peer_n == 0 {
            continue;
        }

        let select_plan = RowPlan::select(query, local, &domain)?;
        let mut cursor = source.select(&select_plan).await?;
        let mut rows_seen = 0u64;
        let mut prev_link: Vec<u8> = Vec::new();
        loop {
            // One batch of rows is masked and written to the wire before any
            // plaintext is queued for S3, so a full queue can always be
            // drained by the rest of the pipeline.
            let mut masked: Vec<MaskedRow<R>> = Vec::with_capacity(batch_size);
            let mut plain: Vec<Vec<R::Elem>> = Vec::with_capacity(batch_size);
            while masked.len() < batch_size {
                let Some(row) = cursor.next_row().await? else {
                    break;
                };
                rows_seen += 1;
                if rows_seen > local_n {
                    return Err(violation("select returned more rows than counted"));
                }
                if row.link.len() != link_size {
                    return Err(violation(format!(
                        "linking key of {} bytes, expected {link_size}",
                        row.link.len()
                    )));
                }
                // The merge join needs both streams in linking order; a
                // backend that breaks its ORDER BY must fail here, not at
                // the coordinator.
                if row.link < prev_link {
                    return Err(violation("select returned rows out of linking order"));
                }
                prev_link.clone_from(&row.link);
                let x = super::encode_row(ring, query, local, &row.values)?;
                let mask = recv_from(&mut ends.masks, "duplex send").await?;
                if mask.len() != k {
                    return Err(violation("mask width"));
                }
                let elems = x
                    .iter()
                    .zip(&mask)
                    .map(|(x, r)| ring.add(x, r))
                    .collect();
                masked.push(MaskedRow {
                    link: row.link,
                    elems,
                });
                plain.push(x);
            }
            if masked.is_empty() {
                break;
            }
            write_masked_rows(conn.writer(), ring, &masked, &mut scratch).await?;
            for x in plain {
                send_flushing(conn.writer(), &ends.to_s3, S3Feed::Row(x), "s3").await?;
            }
        }
        if rows_seen != local_n {
            return Err(violation("select returned fewer rows than counted"));
        }
        conn.flush().await?;
        let cross = recv_from(&mut ends.cross, "duplex receive").await?;
        conn.writer().write_elems(ring, &cross, &mut scratch).await?;
        conn.flush().await?;
        shared.activity().touch();
    }
    Ok(())
}

/// Serves the S2 stream: relays the blinds the duplex receive half generates
/// for the *other* holder's rows.
pub async fn run_s2<R: Ring>(conn: &mut Conn, shared: &DbShared<R>) -> Result<(), ProtoError> {
    let mut ends = shared.take_s2().await?;
    let ring = &shared.ring;
    let tuples = shared.query.tuple_count()?;
    let mut scratch = Vec::new();
    for _ in 0..tuples {
        let n = match recv_from(&mut ends.blinds, "duplex receive").await? {
            BlindEvent::Count(n) => n,
            BlindEvent::Blinds(_) => return Err(violation("blinds before their count")),
        };
        conn.writer().write_i64(n as i64).await?;
        let mut seen = 0u64;
        while seen < n {
            let batch = match recv_from(&mut ends.blinds, "duplex receive").await? {
                BlindEvent::Blinds(batch) => batch,
                BlindEvent::Count(_) => return Err(violation("short blind tuple")),
            };
            seen += batch.len() as u64;
            if seen > n {
                return Err(violation("blind batch overruns the announced count"));
            }
            conn.writer().write_elems(ring, &batch, &mut scratch).await?;
        }
        conn.flush().await?;
        shared.activity().touch();
    }
    Ok(())
}

/// Serves the S3 stream: per unskipped tuple, reads the blinded indicators
/// the coordinator sends for our rows, folds them into the dot-product
/// share, and writes the share back.
pub async fn run_s3<R: Ring>(
    conn: &mut Conn,
    shared: &DbShared<R>,
    local: Party,
) -> Result<(), ProtoError> {
    let mut ends = shared.take_s3().await?;
    let ring = &shared.ring;
    let k = shared.query.agg_count(local);
    let tuples = shared.query.tuple_count()?;
    let mut scratch = Vec::new();
    let mut indicators: VecDeque<R::Elem> = VecDeque::new();
    for _ in 0..tuples {
        let (local_n, peer_n) = match recv_from(&mut ends.feed, "s1").await? {
            S3Feed::Tuple { local, peer } => (local, peer),
            S3Feed::Row(_) => return Err(violation("row before its tuple header")),
        };
        if local_n == 0 || peer_n == 0 {
            continue;
        }
        let mut share = vec![ring.zero(); k];
        for _ in 0..local_n {
            let x = match recv_from(&mut ends.feed, "s1").await? {
                S3Feed::Row(x) => x,
                S3Feed::Tuple { .. } => return Err(violation("short row feed")),
            };
            if x.len() != k {
                return Err(violation("row width"));
            }
            let yb = loop {
                if let Some(e) = indicators.pop_front() {
                    break e;
                }
                let batch = conn.reader().read_elems(ring, &mut scratch).await?;
                if batch.is_empty() {
                    return Err(violation("empty indicator batch"));
                }
                indicators.extend(batch);
            };
            for (acc, x) in share.iter_mut().zip(&x) {
                ring.mul_acc(acc, x, &yb);
            }
        }
        if !indicators.is_empty() {
            return Err(violation("indicator batch overruns the row count"));
        }
        conn.writer().write_elems(ring, &share, &mut scratch).await?;
        conn.flush().await?;
        shared.activity().touch();
    }
    Ok(())
}
