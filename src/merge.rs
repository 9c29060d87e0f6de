//! The coordinator's merge task.
//!
//! Joins the six per-query streams tuple by tuple: cross-checks the row
//! counts both holders report, collects masked rows and blinds for a tuple
//! from all four upstreams concurrently (draining one stream must never
//! depend on another being drained), computes the join multiplicities over
//! the sorted linking keys, hands each holder its blinded indicators, and
//! reconstructs the aggregate sums from the three shares per holder.
//!
//! For a holder `d` with masked rows `m_j = x_j + r_j`, blinds `b_j`
//! (generated by the other holder), match counts `y_j` and cross term
//! `Z = sum r_j * b_j`, the share the holder returns is
//! `S = sum x_j * (y_j - b_j)`, so `sum m_j * b_j - Z + S = sum x_j * y_j`:
//! exactly the column sums over the join, and nothing else the coordinator
//! sees is more than uniform noise.

use std::sync::Arc;

use num_bigint::BigInt;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::decimal::Decimal;
use crate::domain::DomainIterator;
use crate::party::Party;
use crate::proto::{
    BlindEvent, MaskedRow, PhShared, ProtoError, S1Event, S3Cmd, recv_from, send_to, violation,
};
use crate::query::{AggregateFunction, Query};
use crate::result::{Progress, ResultRow, ResultTable};
use crate::ring::Ring;
use crate::sql::SqlValue;
use crate::state::Tracked;

/// The merge ends of the per-query queues, indexed by data holder.
pub struct MergeChannels<R: Ring> {
    /// From the S1 drivers.
    pub s1: [mpsc::Receiver<S1Event<R>>; 2],
    /// From the S2 drivers.
    pub s2: [mpsc::Receiver<BlindEvent<R>>; 2],
    /// To the S3 drivers.
    pub s3_cmd: [mpsc::Sender<S3Cmd<R>>; 2],
    /// From the S3 drivers.
    pub s3_share: [mpsc::Receiver<Vec<R::Elem>>; 2],
}

/// Runs the merge to completion and returns the result table.
#[allow(clippy::too_many_arguments)]
pub async fn run_merge<R: Ring>(
    query: &Arc<Query>,
    ring: &R,
    calc_scale: u32,
    result_scale: u32,
    batch_size: usize,
    mut ch: MergeChannels<R>,
    progress: watch::Sender<Progress>,
    shared: &PhShared,
) -> Result<ResultTable, ProtoError> {
    let mut table = ResultTable::for_query(query);
    let mut domain = DomainIterator::new(Arc::clone(query), Party::Ph)?;
    let total = u64::from(domain.count());
    let k = [
        query.agg_count(Party::DBS[0]),
        query.agg_count(Party::DBS[1]),
    ];
    let mut done = 0u64;
    while domain.next() {
        let [s1a, s1b] = &mut ch.s1;
        let (counts_a, counts_b) = tokio::try_join!(recv_counts(s1a), recv_counts(s1b))?;
        if counts_a.0 != counts_b.1 || counts_b.0 != counts_a.1 {
            return Err(violation(format!(
                "row count drift: {:?} vs {:?}",
                counts_a, counts_b
            )));
        }
        let n = [counts_a.0, counts_b.0];
        let skip = n[0] == 0 || n[1] == 0;

        let finals: [Vec<R::Elem>; 2] = if skip {
            let [s2a, s2b] = &mut ch.s2;
            tokio::try_join!(expect_blind_count(s2a, 0), expect_blind_count(s2b, 0))?;
            [vec![ring.zero(); k[0]], vec![ring.zero(); k[1]]]
        } else {
            let [s1a, s1b] = &mut ch.s1;
            let [s2a, s2b] = &mut ch.s2;
            // DB1's S2 carries the blinds DB1 generated for DB2's rows, and
            // vice versa.
            let ((rows_a, z_b), (rows_b, z_a), blinds_b, blinds_a) = tokio::try_join!(
                collect_side(s1a, n[0]),
                collect_side(s1b, n[1]),
                collect_blinds(s2a, n[1]),
                collect_blinds(s2b, n[0]),
            )?;
            let (y_a, y_b) = match_multiplicities(
                &rows_a.iter().map(|r| r.link.as_slice()).collect::<Vec<_>>(),
                &rows_b.iter().map(|r| r.link.as_slice()).collect::<Vec<_>>(),
            )?;

            let [cmd_a, cmd_b] = &mut ch.s3_cmd;
            let [sh_a, sh_b] = &mut ch.s3_share;
            let (s_a, s_b) = tokio::try_join!(
                settle_side(ring, k[0], &rows_a, &blinds_a, &y_a, batch_size, cmd_a, sh_a),
                settle_side(ring, k[1], &rows_b, &blinds_b, &y_b, batch_size, cmd_b, sh_b),
            )?;
            [
                reconstruct(ring, k[0], &rows_a, &blinds_a, &z_a, &s_a)?,
                reconstruct(ring, k[1], &rows_b, &blinds_b, &z_b, &s_b)?,
            ]
        };

        let mut cells = domain.current()?;
        decode_cells(query, ring, &finals, calc_scale, result_scale, &mut cells)?;
        table.rows.push(ResultRow { cells });
        done += 1;
        let _ = progress.send(Progress {
            tuples_done: done,
            tuples_total: total,
            db_rows: n,
        });
        shared.activity().touch();
    }
    debug!(rows = table.rows.len(), "merge complete");
    Ok(table)
}

async fn recv_counts<R: Ring>(
    rx: &mut mpsc::Receiver<S1Event<R>>,
) -> Result<(u64, u64), ProtoError> {
    match recv_from(rx, "s1 driver").await? {
        S1Event::Counts { local, peer } => Ok((local, peer)),
        _ => Err(violation("s1 stream out of order: expected counts")),
    }
}

async fn collect_side<R: Ring>(
    rx: &mut mpsc::Receiver<S1Event<R>>,
    n: u64,
) -> Result<(Vec<MaskedRow<R>>, Vec<R::Elem>), ProtoError> {
    let mut rows = Vec::with_capacity(n as usize);
    while (rows.len() as u64) < n {
        match recv_from(rx, "s1 driver").await? {
            S1Event::Rows(batch) => rows.extend(batch),
            _ => return Err(violation("s1 stream out of order: expected rows")),
        }
    }
    match recv_from(rx, "s1 driver").await? {
        S1Event::Cross(cross) => Ok((rows, cross)),
        _ => Err(violation("s1 stream out of order: expected the cross term")),
    }
}

async fn expect_blind_count<R: Ring>(
    rx: &mut mpsc::Receiver<BlindEvent<R>>,
    expect: u64,
) -> Result<(), ProtoError> {
    match recv_from(rx, "s2 driver").await? {
        BlindEvent::Count(n) if n == expect => Ok(()),
        BlindEvent::Count(n) => Err(violation(format!(
            "blind count drift: {n}, expected {expect}"
        ))),
        BlindEvent::Blinds(_) => Err(violation("blinds before their count")),
    }
}

async fn collect_blinds<R: Ring>(
    rx: &mut mpsc::Receiver<BlindEvent<R>>,
    n: u64,
) -> Result<Vec<R::Elem>, ProtoError> {
    expect_blind_count(rx, n).await?;
    let mut blinds = Vec::with_capacity(n as usize);
    while (blinds.len() as u64) < n {
        match recv_from(rx, "s2 driver").await? {
            BlindEvent::Blinds(batch) => blinds.extend(batch),
            BlindEvent::Count(_) => return Err(violation("short blind tuple")),
        }
    }
    Ok(blinds)
}

/// Sends one holder its blinded indicators `y_j - b_j` and reads the share
/// back.
#[allow(clippy::too_many_arguments)]
async fn settle_side<R: Ring>(
    ring: &R,
    k: usize,
    rows: &[MaskedRow<R>],
    blinds: &[R::Elem],
    matches: &[u64],
    batch_size: usize,
    cmds: &mpsc::Sender<S3Cmd<R>>,
    shares: &mut mpsc::Receiver<Vec<R::Elem>>,
) -> Result<Vec<R::Elem>, ProtoError> {
    debug_assert_eq!(rows.len(), blinds.len());
    for (ys, bs) in matches.chunks(batch_size).zip(blinds.chunks(batch_size)) {
        let batch = ys
            .iter()
            .zip(bs)
            .map(|(&y, b)| ring.sub(&ring.encode(&BigInt::from(y)), b))
            .collect();
        send_to(cmds, S3Cmd::Yb(batch), "s3 driver").await?;
    }
    send_to(cmds, S3Cmd::Finish { expect: k }, "s3 driver").await?;
    recv_from(shares, "s3 driver").await
}

/// `sum m_j * b_j - Z + S`, elementwise.
fn reconstruct<R: Ring>(
    ring: &R,
    k: usize,
    rows: &[MaskedRow<R>],
    blinds: &[R::Elem],
    cross: &[R::Elem],
    share: &[R::Elem],
) -> Result<Vec<R::Elem>, ProtoError> {
    let mut partial = vec![ring.zero(); k];
    for (row, blind) in rows.iter().zip(blinds) {
        if row.elems.len() != k {
            return Err(violation("masked row width"));
        }
        for (acc, m) in partial.iter_mut().zip(&row.elems) {
            ring.mul_acc(acc, m, blind);
        }
    }
    Ok(partial
        .iter()
        .zip(cross)
        .zip(share)
        .map(|((p, z), s)| ring.sub(&ring.add(p, s), z))
        .collect())
}

/// Join multiplicities of two link-sorted sides: how many rows on the other
/// side each row matches. Unsorted input is a protocol violation.
pub(crate) fn match_multiplicities(
    a: &[&[u8]],
    b: &[&[u8]],
) -> Result<(Vec<u64>, Vec<u64>), ProtoError> {
    for side in [a, b] {
        if side.windows(2).any(|w| w[0] > w[1]) {
            return Err(violation("rows are not in linking order"));
        }
    }
    let mut y_a = vec![0u64; a.len()];
    let mut y_b = vec![0u64; b.len()];
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] < b[j] {
            i += 1;
        } else if a[i] > b[j] {
            j += 1;
        } else {
            let link = a[i];
            let ga = (i..a.len()).take_while(|&x| a[x] == link).count();
            let gb = (j..b.len()).take_while(|&x| b[x] == link).count();
            for y in &mut y_a[i..i + ga] {
                *y = gb as u64;
            }
            for y in &mut y_b[j..j + gb] {
                *y = ga as u64;
            }
            i += ga;
            j += gb;
        }
    }
    Ok((y_a, y_b))
}

/// Decodes the reconstructed sums into result cells, in aggregate order.
fn decode_cells<R: Ring>(
    query: &Query,
    ring: &R,
    finals: &[Vec<R::Elem>; 2],
    calc_scale: u32,
    result_scale: u32,
    cells: &mut Vec<SqlValue>,
) -> Result<(), ProtoError> {
    let mut offsets = [0usize; 2];
    for aggregate in query.aggregates() {
        let d = aggregate.db().db_index();
        let scales = aggregate.decode_scales(query.lexicon());
        let offset = offsets[d];
        offsets[d] += scales.len();
        let values: Vec<Decimal> = finals[d][offset..offset + scales.len()]
            .iter()
            .zip(&scales)
            .map(|(e, &scale)| Decimal::new(ring.lift_signed(e), scale))
            .collect();
        // Counts and plain sums keep their natural scale; the derived
        // aggregates round from the calculation scale down to the published
        // one.
        let natural = matches!(
            aggregate.function,
            AggregateFunction::Count | AggregateFunction::Sum
        );
        cells.push(match combine(aggregate.function, &values, calc_scale) {
            Some(v) if natural => SqlValue::Dec(v),
            Some(v) => SqlValue::Dec(v.rescale(result_scale)),
            None => SqlValue::Null,
        });
    }
    Ok(())
}

/// Combines one aggregate's decoded sums. `values` is `[count]`, `[sum]`,
/// `[count, sum]` or `[count, sum, sum_of_squares]` depending on the
/// function; `None` is SQL NULL.
pub(crate) fn combine(
    function: AggregateFunction,
    values: &[Decimal],
    calc_scale: u32,
) -> Option<Decimal> {
    match function {
        AggregateFunction::Count | AggregateFunction::Sum => Some(values[0].clone()),
        AggregateFunction::Avg => values[1].div(&values[0], calc_scale),
        _ => {
            let (c, s, q) = (&values[0], &values[1], &values[2]);
            let mean = s.div(c, calc_scale)?;
            let varp = q.div(c, calc_scale)?.sub(&mean.mul(&mean));
            match function {
                AggregateFunction::Varp => Some(varp),
                AggregateFunction::Stdevp => Some(varp.sqrt(calc_scale)),
                AggregateFunction::Var | AggregateFunction::Stdev => {
                    let denom = c.sub(&Decimal::from_i64(1));
                    if denom.is_zero() {
                        return None;
                    }
                    let var = varp.mul(c).div(&denom, calc_scale)?;
                    if function == AggregateFunction::Var {
                        Some(var)
                    } else {
                        Some(var.sqrt(calc_scale))
                    }
                }
                _ => unreachable!("count, sum and avg are handled above"),
            }
        }
    }
}
