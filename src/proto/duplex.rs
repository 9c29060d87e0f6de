//! The data-holder duplex.
//!
//! One TCP connection between the two holders carries, per domain tuple and
//! in each direction, the local row count followed by one mask row per local
//! row. The send half generates the masks (shared with the local S1 handler,
//! which adds them to its rows); the receive half turns each incoming mask
//! row into a fresh blind, hands the blinds to the local S2 handler, and
//! accumulates the cross term the local S1 handler relays to the
//! coordinator. The two halves run as separate tasks so neither direction
//! can stall the other.

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing::trace;

use crate::party::Party;
use crate::ring::Ring;
use crate::state::Tracked;
use crate::wire::{ReadConn, WriteConn};

use super::{
    BlindEvent, DbShared, ProtoError, read_elem_rows, recv_from, send_flushing, send_to,
    violation, write_elem_rows,
};

/// Runs the send half for `local`.
pub async fn run_sh<R: Ring>(
    w: &mut WriteConn,
    shared: &DbShared<R>,
    local: Party,
    batch_size: usize,
) -> Result<(), ProtoError> {
    let mut ends = shared.take_sh().await?;
    let ring = &shared.ring;
    let k = shared.query.agg_count(local);
    let tuples = shared.query.tuple_count()?;
    let mut rng = ChaCha20Rng::from_os_rng();
    let mut scratch = Vec::new();
    for tuple in 0..tuples {
        let local_n = recv_from(&mut ends.local_count, "s1").await?;
        w.write_i64(local_n as i64).await?;
        w.flush().await?;
        let peer_n = recv_from(&mut ends.peer_count, "duplex receive").await?;
        trace!(tuple, local_n, peer_n, "duplex counts");
        if local_n == 0 || peer_n == 0 {
            continue;
        }
        let mut remaining = local_n;
        while remaining > 0 {
            let n = remaining.min(batch_size as u64) as usize;
            let rows: Vec<Vec<R::Elem>> = (0..n)
                .map(|_| (0..k).map(|_| ring.random(&mut rng)).collect())
                .collect();
            // The peer sees the masks before the local S1 handler can block
            // on anything downstream of them.
            write_elem_rows(w, ring, &rows, &mut scratch).await?;
            for row in rows {
                send_flushing(w, &ends.masks_to_s1, row, "s1").await?;
            }
            remaining -= n as u64;
        }
        w.flush().await?;
        shared.activity().touch();
    }
    w.flush().await?;
    Ok(())
}

/// Runs the receive half for `local`.
pub async fn run_rh<R: Ring>(
    r: &mut ReadConn,
    shared: &DbShared<R>,
    local: Party,
) -> Result<(), ProtoError> {
    let mut ends = shared.take_rh().await?;
    let ring = &shared.ring;
    let k_peer = shared.query.agg_count(local.peer_db());
    let tuples = shared.query.tuple_count()?;
    let mut rng = ChaCha20Rng::from_os_rng();
    let mut scratch = Vec::new();
    for _ in 0..tuples {
        let local_n = recv_from(&mut ends.local_count, "s1").await?;
        let peer_n = r.read_count().await?;
        send_to(&ends.peer_count_to_s1, peer_n, "s1").await?;
        send_to(&ends.peer_count_to_sh, peer_n, "duplex send").await?;
        if local_n == 0 || peer_n == 0 {
            send_to(&ends.blinds_to_s2, BlindEvent::Count(0), "s2").await?;
            continue;
        }
        send_to(&ends.blinds_to_s2, BlindEvent::Count(peer_n), "s2").await?;
        let mut cross = vec![ring.zero(); k_peer];
        let mut seen = 0u64;
        while seen < peer_n {
            let rows = read_elem_rows(r, ring, k_peer, &mut scratch).await?;
            seen += rows.len() as u64;
            if seen > peer_n {
                return Err(violation("mask batch overruns the announced count"));
            }
            let mut blinds = Vec::with_capacity(rows.len());
            for row in &rows {
                let blind = ring.random(&mut rng);
                for (acc, mask) in cross.iter_mut().zip(row) {
                    ring.mul_acc(acc, mask, &blind);
                }
                blinds.push(blind);
            }
            send_to(&ends.blinds_to_s2, BlindEvent::Blinds(blinds), "s2").await?;
        }
        send_to(&ends.cross_to_s1, cross, "s1").await?;
        shared.activity().touch();
    }
    Ok(())
}
