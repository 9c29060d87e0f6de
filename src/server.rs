//! The long-running nodes.
//!
//! A [`PhNode`] owns a handshaked connection pool per data holder and runs
//! queries end to end: it picks a fresh query id, checks out three
//! connections per holder (S1, S2, S3), spawns the six stream drivers and
//! runs the merge inline. A [`DbNode`] accepts connections, dispatches each
//! query stream to its handler, and (on the lower-ordered holder) dials the
//! duplex to its peer when a query first shows up.
//!
//! A handler failure aborts every sibling task of the same query; the
//! resulting connection teardown propagates the failure to the other nodes.
//! Connections that served a query to completion go back to their pool.

use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::lexicon::{Lexicon, LexiconError};
use crate::merge::{self, MergeChannels};
use crate::party::Party;
use crate::pool::{Pool, Pooled};
use crate::proto::{
    DB_RELEASES, DbShared, PH_RELEASES, PhShared, ProtoError, db, duplex, ph, violation,
};
use crate::query::Query;
use crate::result::{Progress, ResultTable};
use crate::ring::Ring;
use crate::source::RowSource;
use crate::state::{Registry, Tracked, watchdog};
use crate::wire::{Conn, QueryId, StreamHeader, StreamTag, WireError};

/// A node-level failure.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The lexicon is unusable.
    #[error(transparent)]
    Lexicon(#[from] LexiconError),
    /// A query failed.
    #[error(transparent)]
    Proto(#[from] ProtoError),
    /// The listener failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WireError> for NodeError {
    fn from(e: WireError) -> NodeError {
        NodeError::Proto(ProtoError::Wire(e))
    }
}

/// The coordinator.
pub struct PhNode<R: Ring> {
    config: Arc<Config>,
    lexicon: Arc<Lexicon>,
    lexicon_text: String,
    ring: R,
    pools: [Pool<Conn>; 2],
    registry: Arc<Registry<PhShared>>,
}

impl<R: Ring> PhNode<R> {
    /// Builds the coordinator and starts its zombie watchdog.
    pub fn new(config: Config, lexicon: Lexicon, ring: R) -> Result<Arc<PhNode<R>>, NodeError> {
        lexicon.validate()?;
        let lexicon_text = lexicon.canonical_text();
        let node = PhNode {
            pools: [
                Pool::new(config.pool_capacity),
                Pool::new(config.pool_capacity),
            ],
            config: Arc::new(config),
            lexicon: Arc::new(lexicon),
            lexicon_text,
            ring,
            registry: Arc::new(Registry::new()),
        };
        node.spawn_watchdog();
        Ok(Arc::new(node))
    }

    fn spawn_watchdog(&self) {
        if let Some(cooldown) = self.config.zombie_interval() {
            let registry = Arc::clone(&self.registry);
            let threshold = self.config.zombie_check_threshold;
            tokio::spawn(watchdog(registry, cooldown, threshold));
        }
    }

    /// Checks out a handshaked connection to `db` and opens a query stream
    /// on it.
    async fn open_stream(
        &self,
        db: Party,
        tag: StreamTag,
        id: QueryId,
        text: &str,
    ) -> Result<Pooled<Conn>, NodeError> {
        let addr = self.config.address_of(db)?;
        let mut conn = self.pools[db.db_index()]
            .take(|| {
                Conn::connect(
                    addr,
                    Party::Ph,
                    db,
                    &self.lexicon_text,
                    self.config.channel_output_buffer_limit,
                )
            })
            .await?;
        let header = StreamHeader {
            tag,
            id,
            text: text.to_string(),
        };
        if let Err(e) = conn.write_header(&header).await {
            // A pooled connection may have died while idle; retry once on a
            // fresh one.
            warn!(%db, error = %e, "pooled connection failed, redialing");
            conn.discard();
            let mut fresh = self.pools[db.db_index()]
                .take(|| {
                    Conn::connect(
                        addr,
                        Party::Ph,
                        db,
                        &self.lexicon_text,
                        self.config.channel_output_buffer_limit,
                    )
                })
                .await?;
            fresh.write_header(&header).await?;
            return Ok(fresh);
        }
        Ok(conn)
    }

    /// Runs one query to completion.
    pub async fn run_query(&self, text: &str) -> Result<ResultTable, NodeError> {
        let (progress, _) = watch::channel(Progress::start(0));
        self.run_query_watched(text, progress).await
    }

    /// Runs one query, publishing per-tuple progress on `progress`.
    pub async fn run_query_watched(
        &self,
        text: &str,
        progress: watch::Sender<Progress>,
    ) -> Result<ResultTable, NodeError> {
        let id = QueryId::random(&mut rand::rng());
        self.run_query_inner(id, text, progress).await
    }

    /// Starts a query in the background and returns a handle carrying its
    /// id, the progress feed and a cancellation hook.
    pub fn start_query(self: &Arc<Self>, text: &str) -> QueryHandle {
        let id = QueryId::random(&mut rand::rng());
        let (progress_tx, progress_rx) = watch::channel(Progress::start(0));
        let node = Arc::clone(self);
        let text = text.to_string();
        let task =
            tokio::spawn(async move { node.run_query_inner(id, &text, progress_tx).await });
        QueryHandle {
            id,
            progress: progress_rx,
            registry: Arc::clone(&self.registry),
            task,
        }
    }

    async fn run_query_inner(
        &self,
        id: QueryId,
        text: &str,
        progress: watch::Sender<Progress>,
    ) -> Result<ResultTable, NodeError> {
        let query = Arc::new(
            Query::parse(text, Arc::clone(&self.lexicon)).map_err(ProtoError::Query)?,
        );
        info!(query = %id, text, "running query");
        let shared = self
            .registry
            .create_or_get(id, PH_RELEASES, || Ok::<_, NodeError>(PhShared::new()))?;

        let cap = self.config.queue_capacity;
        let (s1a_tx, s1a_rx) = mpsc::channel(cap);
        let (s1b_tx, s1b_rx) = mpsc::channel(cap);
        let (s2a_tx, s2a_rx) = mpsc::channel(cap);
        let (s2b_tx, s2b_rx) = mpsc::channel(cap);
        let (cmd_a_tx, cmd_a_rx) = mpsc::channel(cap);
        let (cmd_b_tx, cmd_b_rx) = mpsc::channel(cap);
        let (sh_a_tx, sh_a_rx) = mpsc::channel(cap);
        let (sh_b_tx, sh_b_rx) = mpsc::channel(cap);

        // All six streams are opened before any driver runs, so a holder
        // seeing one stream of the query can expect the rest.
        let conn_s1a = self.open_stream(Party::Db1, StreamTag::S1, id, text).await?;
        let conn_s1b = self.open_stream(Party::Db2, StreamTag::S1, id, text).await?;
        let conn_s2a = self.open_stream(Party::Db1, StreamTag::S2, id, text).await?;
        let conn_s2b = self.open_stream(Party::Db2, StreamTag::S2, id, text).await?;
        let conn_s3a = self.open_stream(Party::Db1, StreamTag::S3, id, text).await?;
        let conn_s3b = self.open_stream(Party::Db2, StreamTag::S3, id, text).await?;

        for (db, mut conn, tx) in [
            (Party::Db1, conn_s1a, s1a_tx),
            (Party::Db2, conn_s1b, s1b_tx),
        ] {
            let (query, ring, task_shared) =
                (Arc::clone(&query), self.ring.clone(), Arc::clone(&shared));
            let registry = Arc::clone(&self.registry);
            let handle = tokio::spawn(async move {
                conn.set_reusable(false);
                let result = ph::run_s1(&mut conn, &query, &ring, db, &task_shared, tx).await;
                settle_driver(result, conn, &registry, id, "s1");
            });
            shared.tasks().register(handle.abort_handle());
        }
        for (mut conn, tx) in [(conn_s2a, s2a_tx), (conn_s2b, s2b_tx)] {
            let (query, ring, task_shared) =
                (Arc::clone(&query), self.ring.clone(), Arc::clone(&shared));
            let registry = Arc::clone(&self.registry);
            let handle = tokio::spawn(async move {
                conn.set_reusable(false);
                let result = ph::run_s2(&mut conn, &query, &ring, &task_shared, tx).await;
                settle_driver(result, conn, &registry, id, "s2");
            });
            shared.tasks().register(handle.abort_handle());
        }
        for (mut conn, cmds, shares) in [
            (conn_s3a, cmd_a_rx, sh_a_tx),
            (conn_s3b, cmd_b_rx, sh_b_tx),
        ] {
            let (ring, task_shared) = (self.ring.clone(), Arc::clone(&shared));
            let registry = Arc::clone(&self.registry);
            let handle = tokio::spawn(async move {
                conn.set_reusable(false);
                let result = ph::run_s3(&mut conn, &ring, &task_shared, cmds, shares).await;
                settle_driver(result, conn, &registry, id, "s3");
            });
            shared.tasks().register(handle.abort_handle());
        }

        let channels = MergeChannels {
            s1: [s1a_rx, s1b_rx],
            s2: [s2a_rx, s2b_rx],
            s3_cmd: [cmd_a_tx, cmd_b_tx],
            s3_share: [sh_a_rx, sh_b_rx],
        };
        let merged = merge::run_merge(
            &query,
            &self.ring,
            self.config.calculation_scale,
            self.config.result_scale,
            self.config.row_batch_size,
            channels,
            progress,
            &shared,
        )
        .await;
        match merged {
            Ok(table) => {
                debug!(query = %id, rows = table.rows.len(), "query complete");
                Ok(table)
            }
            Err(e) => {
                warn!(query = %id, error = %e, "merge failed");
                self.registry.abort(id);
                Err(e.into())
            }
        }
    }
}

/// A query running in the background, started with [`PhNode::start_query`].
pub struct QueryHandle {
    id: QueryId,
    progress: watch::Receiver<Progress>,
    registry: Arc<Registry<PhShared>>,
    task: tokio::task::JoinHandle<Result<ResultTable, NodeError>>,
}

impl QueryHandle {
    /// The query's id.
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// A receiver of the per-tuple progress snapshots.
    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    /// Fails every handler of the query. Best-effort and idempotent; a
    /// query that already finished is unaffected.
    pub fn cancel(&self) {
        self.registry.abort(self.id);
    }

    /// Waits for the result table. A cancelled query surfaces as an error,
    /// never as a partial table.
    pub async fn result(self) -> Result<ResultTable, NodeError> {
        self.task
            .await
            .map_err(|_| NodeError::Proto(ProtoError::Closed("query driver")))?
    }
}

/// Common tail of every coordinator driver task.
fn settle_driver(
    result: Result<(), ProtoError>,
    mut conn: Pooled<Conn>,
    registry: &Registry<PhShared>,
    id: QueryId,
    what: &str,
) {
    match result {
        Ok(()) => {
            conn.set_reusable(true);
            drop(conn); // back to the pool
            registry.release(id);
        }
        Err(e) => {
            warn!(query = %id, driver = what, error = %e, "driver failed");
            conn.discard();
            registry.abort(id);
        }
    }
}

/// One data holder.
pub struct DbNode<R: Ring, S: RowSource> {
    config: Arc<Config>,
    lexicon: Arc<Lexicon>,
    lexicon_text: String,
    ring: R,
    local: Party,
    source: Arc<S>,
    registry: Arc<Registry<DbShared<R>>>,
}

impl<R: Ring, S: RowSource> DbNode<R, S> {
    /// Builds the holder node and starts its zombie watchdog.
    pub fn new(config: Config, lexicon: Lexicon, ring: R, source: S) -> Result<Arc<DbNode<R, S>>, NodeError> {
        lexicon.validate()?;
        if !config.local_party.is_db() {
            return Err(NodeError::Config(ConfigError::Invalid(
                "a data holder node needs local_party db1 or db2".into(),
            )));
        }
        let lexicon_text = lexicon.canonical_text();
        let node = Arc::new(DbNode {
            local: config.local_party,
            config: Arc::new(config),
            lexicon: Arc::new(lexicon),
            lexicon_text,
            ring,
            source: Arc::new(source),
            registry: Arc::new(Registry::new()),
        });
        if let Some(cooldown) = node.config.zombie_interval() {
            let registry = Arc::clone(&node.registry);
            let threshold = node.config.zombie_check_threshold;
            tokio::spawn(watchdog(registry, cooldown, threshold));
        }
        Ok(node)
    }

    /// Accepts and serves connections forever.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), NodeError> {
        info!(party = %self.local, addr = %listener.local_addr()?, "data holder listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!(%addr, "accepted connection");
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = node.serve_conn(stream).await {
                    warn!(%addr, error = %e, "connection closed");
                }
            });
        }
    }

    /// Handshakes one inbound connection and serves query streams on it
    /// until the peer hangs up.
    async fn serve_conn(&self, stream: TcpStream) -> Result<(), NodeError> {
        let mut conn = Conn::accept(
            stream,
            &self.lexicon_text,
            self.config.channel_output_buffer_limit,
        )
        .await?;
        loop {
            let header = match conn.read_header().await {
                Ok(header) => header,
                // A clean close between queries is the normal end of a
                // pooled connection.
                Err(WireError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            match self.serve_stream(conn, header).await? {
                Some(reusable) => conn = reusable,
                // Duplex connections are consumed by their query.
                None => return Ok(()),
            }
        }
    }

    async fn serve_stream(
        &self,
        conn: Conn,
        header: StreamHeader,
    ) -> Result<Option<Conn>, NodeError> {
        let id = header.id;
        let shared = self.shared_for(&header)?;
        if shared.query.text() != header.text {
            self.registry.abort(id);
            return Err(violation("query text drift between streams").into());
        }
        let batch = self.config.row_batch_size;
        let local = self.local;
        let registry = Arc::clone(&self.registry);
        let source = Arc::clone(&self.source);
        let task_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            let mut conn = conn;
            let result = match header.tag {
                StreamTag::S1 => {
                    db::run_s1(&mut conn, &task_shared, &*source, local, batch).await
                }
                StreamTag::S2 => db::run_s2(&mut conn, &task_shared).await,
                StreamTag::S3 => db::run_s3(&mut conn, &task_shared, local).await,
                StreamTag::Dx => {
                    let (mut r, mut w) = conn.into_split();
                    let (sh, rh) = tokio::join!(
                        duplex::run_sh(&mut w, &task_shared, local, batch),
                        duplex::run_rh(&mut r, &task_shared, local),
                    );
                    // The duplex is per query; both halves must finish.
                    return (None, sh.and(rh));
                }
            };
            (Some(conn), result)
        });
        shared.tasks().register(task.abort_handle());
        let (conn, result) = task
            .await
            .map_err(|_| ProtoError::Closed("stream handler"))?;
        match result {
            Ok(()) => {
                registry.release(id);
                Ok(conn)
            }
            Err(e) => {
                warn!(query = %id, tag = ?header.tag, error = %e, "handler failed");
                registry.abort(id);
                Err(e.into())
            }
        }
    }

    /// The shared record for a query, created on first contact. Creation on
    /// the lower-ordered holder also dials the duplex to the peer.
    fn shared_for(&self, header: &StreamHeader) -> Result<Arc<DbShared<R>>, NodeError> {
        let mut created = false;
        let shared = self.registry.create_or_get(header.id, DB_RELEASES, || {
            let query = Arc::new(
                Query::parse(&header.text, Arc::clone(&self.lexicon))
                    .map_err(ProtoError::Query)?,
            );
            created = true;
            Ok::<_, NodeError>(DbShared::new(
                query,
                self.ring.clone(),
                self.config.queue_capacity,
            ))
        })?;
        if created && self.local.connects_to(self.local.peer_db()) {
            self.dial_duplex(header, &shared)?;
        }
        Ok(shared)
    }

    fn dial_duplex(
        &self,
        header: &StreamHeader,
        shared: &Arc<DbShared<R>>,
    ) -> Result<(), NodeError> {
        let peer = self.local.peer_db();
        let addr = self.config.address_of(peer)?;
        let local = self.local;
        let lexicon_text = self.lexicon_text.clone();
        let buffer = self.config.channel_output_buffer_limit;
        let batch = self.config.row_batch_size;
        let id = header.id;
        let header = StreamHeader {
            tag: StreamTag::Dx,
            id,
            text: header.text.clone(),
        };
        let registry = Arc::clone(&self.registry);
        let task_shared = Arc::clone(shared);
        let task = tokio::spawn(async move {
            let result = async {
                let mut conn = Conn::connect(addr, local, peer, &lexicon_text, buffer).await?;
                conn.write_header(&header).await?;
                let (mut r, mut w) = conn.into_split();
                let (sh, rh) = tokio::join!(
                    duplex::run_sh(&mut w, &task_shared, local, batch),
                    duplex::run_rh(&mut r, &task_shared, local),
                );
                sh.and(rh)
            }
            .await;
            match result {
                Ok(()) => {
                    registry.release(id);
                }
                Err(e) => {
                    warn!(query = %id, error = %e, "duplex failed");
                    registry.abort(id);
                }
            }
        });
        shared.tasks().register(task.abort_handle());
        Ok(())
    }
}
