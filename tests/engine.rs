//! End-to-end queries over three loopback nodes.
//!
//! Each test boots two [`DbNode`]s on ephemeral TCP ports, seeds them with
//! in-memory tables and runs real queries through a [`PhNode`], comparing
//! the merged table against the plaintext join computed by hand.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use num_bigint::BigUint;
use tokio::net::TcpListener;
use tokio::sync::watch;

use privjoin::config::Config;
use privjoin::lexicon::Lexicon;
use privjoin::party::Party;
use privjoin::result::{Progress, ResultRow, ResultTable};
use privjoin::ring::{Ring, SelectedRing, select_ring};
use privjoin::server::{DbNode, PhNode};
use privjoin::source::{
    MemoryCursor, MemorySource, RowCursor, RowPlan, RowSource, SourceError, SourceRow,
};
use privjoin::sql::SqlValue;

fn lexicon(modulus: &str) -> Lexicon {
    serde_json::from_str(&format!(
        r#"{{
            "common": {{ "modulus": "{modulus}" }},
            "dbs": {{
                "db1": {{
                    "name": "incomes",
                    "linking_column": "person_id",
                    "columns": [
                        {{ "name": "person_id", "type": "string" }},
                        {{ "name": "amount", "type": "decimal", "scale": 2 }},
                        {{ "name": "region", "type": "string",
                           "domain": ["east", "west"] }}
                    ]
                }},
                "db2": {{
                    "name": "degrees",
                    "linking_column": "person_id",
                    "columns": [
                        {{ "name": "person_id", "type": "string" }},
                        {{ "name": "years", "type": "int" }},
                        {{ "name": "school", "type": "string",
                           "domain": ["uva", "vt", "vcu"] }}
                    ]
                }}
            }}
        }}"#
    ))
    .unwrap()
}

fn config(local: Party, listen: Option<SocketAddr>, db2: Option<SocketAddr>) -> Config {
    let mut fields = vec![format!(r#""local_party": "{local}""#)];
    if let Some(addr) = listen {
        fields.push(format!(r#""listen": "{addr}""#));
    }
    if let Some(addr) = db2 {
        fields.push(format!(r#""db2": "{addr}""#));
    }
    fields.push(r#""calculation_scale": 6"#.into());
    fields.push(r#""result_scale": 2"#.into());
    // Tiny batches and queues so multi-batch paths run even on small tables.
    fields.push(r#""row_batch_size": 3"#.into());
    fields.push(r#""queue_capacity": 4"#.into());
    fields.push(r#""pool_capacity": 3"#.into());
    fields.push(r#""zombie_check_cooldown": 0"#.into());
    Config::parse(&format!("{{ {} }}", fields.join(", "))).unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Boots both data holders and returns a coordinator wired to them. The
/// coordinator may carry a different lexicon than the holders.
async fn cluster<R: Ring, D1: RowSource, D2: RowSource>(
    ph_lexicon: Lexicon,
    db_lexicon: Lexicon,
    ring: R,
    db1_rows: D1,
    db2_rows: D2,
) -> Arc<PhNode<R>> {
    init_tracing();
    let l1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let l2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let a1 = l1.local_addr().unwrap();
    let a2 = l2.local_addr().unwrap();

    let db1 = DbNode::new(
        config(Party::Db1, Some(a1), Some(a2)),
        db_lexicon.clone(),
        ring.clone(),
        db1_rows,
    )
    .unwrap();
    tokio::spawn(db1.run(l1));
    let db2 = DbNode::new(
        config(Party::Db2, Some(a2), None),
        db_lexicon,
        ring.clone(),
        db2_rows,
    )
    .unwrap();
    tokio::spawn(db2.run(l2));

    let mut ph_config = config(Party::Ph, None, Some(a2));
    ph_config.db1 = Some(a1);
    PhNode::new(ph_config, ph_lexicon, ring).unwrap()
}

fn dec(s: &str) -> SqlValue {
    SqlValue::Dec(s.parse().unwrap())
}

fn text(s: &str) -> SqlValue {
    SqlValue::Text(s.to_string())
}

fn rows(cells: Vec<Vec<SqlValue>>) -> Vec<ResultRow> {
    cells.into_iter().map(|cells| ResultRow { cells }).collect()
}

/// Five income rows. `p4` has a null amount and `p6` holds no degree.
fn incomes(lexicon: &Arc<Lexicon>) -> MemorySource {
    let mut s = MemorySource::new(Arc::clone(lexicon), Party::Db1);
    s.add_row(b"p1", vec![("amount", dec("10.00")), ("region", text("east"))]);
    s.add_row(b"p2", vec![("amount", dec("7.50")), ("region", text("east"))]);
    s.add_row(b"p3", vec![("amount", dec("2.00")), ("region", text("west"))]);
    s.add_row(b"p4", vec![("amount", SqlValue::Null), ("region", text("west"))]);
    s.add_row(b"p6", vec![("amount", dec("100.00")), ("region", text("east"))]);
    s
}

/// Five degree rows. `p5` holds no income.
fn degrees(lexicon: &Arc<Lexicon>) -> MemorySource {
    let mut s = MemorySource::new(Arc::clone(lexicon), Party::Db2);
    s.add_row(b"p1", vec![("years", SqlValue::Int(4)), ("school", text("uva"))]);
    s.add_row(b"p2", vec![("years", SqlValue::Int(6)), ("school", text("uva"))]);
    s.add_row(b"p3", vec![("years", SqlValue::Int(2)), ("school", text("vt"))]);
    s.add_row(b"p4", vec![("years", SqlValue::Int(8)), ("school", text("vt"))]);
    s.add_row(b"p5", vec![("years", SqlValue::Int(10)), ("school", text("vcu"))]);
    s
}

const JOIN_QUERY: &str = "aggregate=sum:amount&aggregate=avg:amount\
                          &aggregate=count:years&group_by=region&group_by=school";

fn join_query_table() -> ResultTable {
    ResultTable {
        columns: vec![
            "incomes.region".into(),
            "degrees.school".into(),
            "sum(incomes.amount)".into(),
            "avg(incomes.amount)".into(),
            "count(degrees.years)".into(),
        ],
        rows: rows(vec![
            vec![text("east"), text("uva"), dec("17.50"), dec("8.75"), dec("2")],
            vec![text("east"), text("vt"), dec("0"), SqlValue::Null, dec("0")],
            vec![text("east"), text("vcu"), dec("0"), SqlValue::Null, dec("0")],
            vec![text("west"), text("uva"), dec("0"), SqlValue::Null, dec("0")],
            vec![text("west"), text("vt"), dec("2.00"), dec("2.00"), dec("2")],
            vec![text("west"), text("vcu"), dec("0"), SqlValue::Null, dec("0")],
        ]),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn joins_and_aggregates_match_the_plaintext_query() {
    let lex = lexicon("4294967291");
    let SelectedRing::U32(ring) = select_ring(&lex.modulus().unwrap()) else {
        panic!("expected a 32-bit ring");
    };
    let sources = Arc::new(lex.clone());
    let ph = cluster(
        lex.clone(),
        lex,
        ring,
        incomes(&sources),
        degrees(&sources),
    )
    .await;

    let (progress_tx, progress_rx) = watch::channel(Progress::start(0));
    let table = ph.run_query_watched(JOIN_QUERY, progress_tx).await.unwrap();
    assert_eq!(table, join_query_table());
    // The last merged tuple is (west, vcu): two west incomes, one vcu degree.
    assert_eq!(
        *progress_rx.borrow(),
        Progress {
            tuples_done: 6,
            tuples_total: 6,
            db_rows: [2, 1],
        }
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn a_wide_modulus_produces_the_same_table() {
    let modulus: BigUint = (BigUint::from(1u8) << 127) + 1u8;
    let lex = lexicon(&modulus.to_string());
    let SelectedRing::Big(ring) = select_ring(&modulus) else {
        panic!("expected a wide ring");
    };
    let sources = Arc::new(lex.clone());
    let ph = cluster(
        lex.clone(),
        lex,
        ring,
        incomes(&sources),
        degrees(&sources),
    )
    .await;

    let table = ph.run_query(JOIN_QUERY).await.unwrap();
    assert_eq!(table, join_query_table());
}

#[tokio::test(flavor = "multi_thread")]
async fn prefilters_and_variance_aggregates() {
    let lex = lexicon("4294967291");
    let SelectedRing::U32(ring) = select_ring(&lex.modulus().unwrap()) else {
        panic!("expected a 32-bit ring");
    };
    let sources = Arc::new(lex.clone());
    let ph = cluster(
        lex.clone(),
        lex,
        ring,
        incomes(&sources),
        degrees(&sources),
    )
    .await;

    // Only p1, p2 and p6 clear the prefilter; their matched degrees are 4
    // and 6 years. The west tuple has no qualifying income rows at all, so
    // it is skipped and decodes as null.
    let table = ph
        .run_query(
            "aggregate=var:years&aggregate=stdevp:years\
             &group_by=region&prefilter=incomes:amount>=5.00",
        )
        .await
        .unwrap();
    let expected = ResultTable {
        columns: vec![
            "incomes.region".into(),
            "var(degrees.years)".into(),
            "stdevp(degrees.years)".into(),
        ],
        rows: rows(vec![
            vec![text("east"), dec("2.00"), dec("1.00")],
            vec![text("west"), SqlValue::Null, SqlValue::Null],
        ]),
    };
    assert_eq!(table, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_linking_keys_multiply_like_a_join() {
    let lex = lexicon("4294967291");
    let SelectedRing::U32(ring) = select_ring(&lex.modulus().unwrap()) else {
        panic!("expected a 32-bit ring");
    };
    let sources = Arc::new(lex.clone());
    let mut db1 = MemorySource::new(Arc::clone(&sources), Party::Db1);
    db1.add_row(b"k", vec![("amount", dec("1.00")), ("region", text("east"))]);
    db1.add_row(b"k", vec![("amount", dec("2.00")), ("region", text("east"))]);
    let mut db2 = MemorySource::new(Arc::clone(&sources), Party::Db2);
    db2.add_row(b"k", vec![("years", SqlValue::Int(3)), ("school", text("uva"))]);
    db2.add_row(b"k", vec![("years", SqlValue::Int(5)), ("school", text("uva"))]);
    let ph = cluster(lex.clone(), lex, ring, db1, db2).await;

    // Two rows on each side with the same key join into four rows.
    let table = ph
        .run_query("aggregate=sum:amount&aggregate=count:years&group_by=region")
        .await
        .unwrap();
    let expected = ResultTable {
        columns: vec![
            "incomes.region".into(),
            "sum(incomes.amount)".into(),
            "count(degrees.years)".into(),
        ],
        rows: rows(vec![
            vec![text("east"), dec("6.00"), dec("4")],
            vec![text("west"), dec("0"), dec("0")],
        ]),
    };
    assert_eq!(table, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn pooled_connections_serve_consecutive_queries() {
    let lex = lexicon("4294967291");
    let SelectedRing::U32(ring) = select_ring(&lex.modulus().unwrap()) else {
        panic!("expected a 32-bit ring");
    };
    let sources = Arc::new(lex.clone());
    let ph = cluster(
        lex.clone(),
        lex,
        ring,
        incomes(&sources),
        degrees(&sources),
    )
    .await;

    // The second query reuses the pooled connections of the first.
    let first = ph.run_query(JOIN_QUERY).await.unwrap();
    let second = ph.run_query(JOIN_QUERY).await.unwrap();
    assert_eq!(first, join_query_table());
    assert_eq!(second, first);
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_lexicons_refuse_to_run() {
    let db_lex = lexicon("4294967291");
    let ph_lex = lexicon("2147483647");
    let SelectedRing::U32(ring) = select_ring(&ph_lex.modulus().unwrap()) else {
        panic!("expected a 32-bit ring");
    };
    let sources = Arc::new(db_lex.clone());
    let ph = cluster(
        ph_lex,
        db_lex,
        ring,
        incomes(&sources),
        degrees(&sources),
    )
    .await;

    let err = ph.run_query(JOIN_QUERY).await.unwrap_err();
    assert!(err.to_string().contains("lexicon"), "{err}");
}

/// A cursor over pre-collected rows.
struct Replay {
    rows: std::vec::IntoIter<SourceRow>,
}

impl RowCursor for Replay {
    async fn next_row(&mut self) -> Result<Option<SourceRow>, SourceError> {
        Ok(self.rows.next())
    }
}

/// A backend that breaks its ORDER BY: rows come back in reverse linking
/// order.
struct ReversedSource(MemorySource);

impl RowSource for ReversedSource {
    type Cursor = Replay;

    async fn count(&self, plan: &RowPlan) -> Result<u64, SourceError> {
        self.0.count(plan).await
    }

    async fn select(&self, plan: &RowPlan) -> Result<Replay, SourceError> {
        let mut cursor = self.0.select(plan).await?;
        let mut rows = Vec::new();
        while let Some(row) = cursor.next_row().await? {
            rows.push(row);
        }
        rows.reverse();
        Ok(Replay {
            rows: rows.into_iter(),
        })
    }
}

/// A backend whose COUNT claims one more row than the SELECT delivers.
struct DriftingSource(MemorySource);

impl RowSource for DriftingSource {
    type Cursor = MemoryCursor;

    async fn count(&self, plan: &RowPlan) -> Result<u64, SourceError> {
        Ok(self.0.count(plan).await? + 1)
    }

    async fn select(&self, plan: &RowPlan) -> Result<MemoryCursor, SourceError> {
        self.0.select(plan).await
    }
}

/// A backend that never answers.
struct StalledSource;

impl RowSource for StalledSource {
    type Cursor = Replay;

    async fn count(&self, _plan: &RowPlan) -> Result<u64, SourceError> {
        std::future::pending().await
    }

    async fn select(&self, _plan: &RowPlan) -> Result<Replay, SourceError> {
        std::future::pending().await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn an_unsorted_backend_is_a_fatal_violation() {
    let lex = lexicon("4294967291");
    let SelectedRing::U32(ring) = select_ring(&lex.modulus().unwrap()) else {
        panic!("expected a 32-bit ring");
    };
    let sources = Arc::new(lex.clone());
    let ph = cluster(
        lex.clone(),
        lex,
        ring,
        ReversedSource(incomes(&sources)),
        degrees(&sources),
    )
    .await;

    // The east tuple selects three income rows; replayed in reverse order
    // they break the merge join's collation contract.
    let err = ph
        .run_query("aggregate=sum:amount&group_by=region")
        .await
        .unwrap_err();
    assert!(!err.to_string().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn a_count_drifting_backend_is_a_fatal_violation() {
    let lex = lexicon("4294967291");
    let SelectedRing::U32(ring) = select_ring(&lex.modulus().unwrap()) else {
        panic!("expected a 32-bit ring");
    };
    let sources = Arc::new(lex.clone());
    let ph = cluster(
        lex.clone(),
        lex,
        ring,
        DriftingSource(incomes(&sources)),
        degrees(&sources),
    )
    .await;

    let err = ph
        .run_query("aggregate=sum:amount&group_by=region")
        .await
        .unwrap_err();
    assert!(!err.to_string().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_a_stalled_query_fails_it() {
    let lex = lexicon("4294967291");
    let SelectedRing::U32(ring) = select_ring(&lex.modulus().unwrap()) else {
        panic!("expected a 32-bit ring");
    };
    let sources = Arc::new(lex.clone());
    let ph = cluster(lex.clone(), lex, ring, StalledSource, degrees(&sources)).await;

    let handle = ph.start_query(JOIN_QUERY);
    // Give the streams time to open and stall on the unresponsive backend.
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();
    assert!(handle.result().await.is_err());
}
