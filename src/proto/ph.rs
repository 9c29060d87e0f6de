//! Coordinator-side stream drivers.
//!
//! One driver per connection; each parses nothing by itself and simply moves
//! frames between its connection and the merge task's queues, checking the
//! counts the stream announced against what actually arrives.

use tokio::sync::mpsc;
use tracing::trace;

use crate::party::Party;
use crate::query::Query;
use crate::ring::Ring;
use crate::state::Tracked;
use crate::wire::Conn;

use super::{
    BlindEvent, PhShared, ProtoError, S1Event, S3Cmd, read_masked_rows, send_to, violation,
};

/// Drives one data holder's S1 stream: per tuple the two row counts, then
/// (unless the tuple is skipped) the masked rows and the cross term.
pub async fn run_s1<R: Ring>(
    conn: &mut Conn,
    query: &Query,
    ring: &R,
    db: Party,
    shared: &PhShared,
    tx: mpsc::Sender<S1Event<R>>,
) -> Result<(), ProtoError> {
    let k = query.agg_count(db);
    // The cross term this stream relays was accumulated by `db`'s receive
    // half over the *peer's* mask rows, so it has the peer's width.
    let k_cross = query.agg_count(db.peer_db());
    let link_size = query.lexicon().common.linking_column_size as usize;
    let tuples = query.tuple_count()?;
    let mut scratch = Vec::new();
    for tuple in 0..tuples {
        let local = conn.reader().read_count().await?;
        let peer = conn.reader().read_count().await?;
        trace!(%db, tuple, local, peer, "s1 counts");
        send_to(&tx, S1Event::Counts { local, peer }, "merge").await?;
        shared.activity().touch();
        if local == 0 || peer == 0 {
            continue;
        }
        let mut seen = 0u64;
        while seen < local {
            let rows = read_masked_rows(conn.reader(), ring, link_size, k, &mut scratch).await?;
            seen += rows.len() as u64;
            if seen > local {
                return Err(violation("row batch overruns the announced count"));
            }
            send_to(&tx, S1Event::Rows(rows), "merge").await?;
        }
        let cross = conn.reader().read_elems(ring, &mut scratch).await?;
        if cross.len() != k_cross {
            return Err(violation(format!(
                "cross term has {} elements, expected {k_cross}",
                cross.len()
            )));
        }
        send_to(&tx, S1Event::Cross(cross), "merge").await?;
        shared.activity().touch();
    }
    Ok(())
}

/// Drives one data holder's S2 stream: per tuple a blind count, then that
/// many blinds for the *other* holder's rows.
pub async fn run_s2<R: Ring>(
    conn: &mut Conn,
    query: &Query,
    ring: &R,
    shared: &PhShared,
    tx: mpsc::Sender<BlindEvent<R>>,
) -> Result<(), ProtoError> {
    let tuples = query.tuple_count()?;
    let mut scratch = Vec::new();
    for _ in 0..tuples {
        let n = conn.reader().read_count().await?;
        send_to(&tx, BlindEvent::Count(n), "merge").await?;
        shared.activity().touch();
        let mut seen = 0u64;
        while seen < n {
            let batch = conn.reader().read_elems(ring, &mut scratch).await?;
            if batch.is_empty() {
                return Err(violation("empty blind batch"));
            }
            seen += batch.len() as u64;
            if seen > n {
                return Err(violation("blind batch overruns the announced count"));
            }
            send_to(&tx, BlindEvent::Blinds(batch), "merge").await?;
        }
    }
    Ok(())
}

/// Drives one data holder's S3 stream: writes blinded indicator batches on
/// command and reads the dot-product share back after each tuple.
pub async fn run_s3<R: Ring>(
    conn: &mut Conn,
    ring: &R,
    shared: &PhShared,
    mut cmds: mpsc::Receiver<S3Cmd<R>>,
    shares: mpsc::Sender<Vec<R::Elem>>,
) -> Result<(), ProtoError> {
    let mut scratch = Vec::new();
    while let Some(cmd) = cmds.recv().await {
        match cmd {
            S3Cmd::Yb(batch) => {
                conn.writer().write_elems(ring, &batch, &mut scratch).await?;
            }
            S3Cmd::Finish { expect } => {
                conn.flush().await?;
                let share = conn.reader().read_elems(ring, &mut scratch).await?;
                if share.len() != expect {
                    return Err(violation(format!(
                        "share has {} elements, expected {expect}",
                        share.len()
                    )));
                }
                send_to(&shares, share, "merge").await?;
                shared.activity().touch();
            }
        }
    }
    Ok(())
}
