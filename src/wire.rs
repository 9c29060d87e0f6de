//! The binary TCP wire layer.
//!
//! Every multi-byte integer on the wire is big-endian. A connection starts
//! with a handshake (the dialing party's id, then a mutual lexicon exchange
//! that must match byte for byte); after that it carries any number of query
//! streams, each opened by a tagged header. Handshaked connections are pooled
//! per remote party and reused across queries.
//!
//! Writes land in a buffer of configured capacity and only reach the socket
//! on overflow or an explicit [`WriteConn::flush`]; handlers flush at every
//! point where the receiving side must act before they can continue.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::party::Party;
use crate::ring::Ring;

/// Frames on the wire never exceed this many bytes.
const MAX_FRAME: i32 = 1 << 24;

/// A wire-layer failure. Always fatal for the connection.
#[derive(Debug, Error)]
pub enum WireError {
    /// The socket failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The peer sent bytes that do not parse as the expected frame.
    #[error("malformed frame: {0}")]
    BadFrame(String),
    /// The peer's lexicon differs from ours.
    #[error("lexicon mismatch with {0}")]
    LexiconMismatch(Party),
}

/// Identifies which sub-protocol stream a connection is serving for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTag {
    /// Masked shares up, blinded indicators down.
    S1,
    /// Blinds for the other data holder's rows.
    S2,
    /// The final dot-product share.
    S3,
    /// The data-holder duplex.
    Dx,
}

impl StreamTag {
    fn to_int(self) -> i32 {
        match self {
            StreamTag::S1 => 1,
            StreamTag::S2 => 2,
            StreamTag::S3 => 3,
            StreamTag::Dx => 4,
        }
    }

    fn from_int(v: i32) -> Result<StreamTag, WireError> {
        match v {
            1 => Ok(StreamTag::S1),
            2 => Ok(StreamTag::S2),
            3 => Ok(StreamTag::S3),
            4 => Ok(StreamTag::Dx),
            _ => Err(WireError::BadFrame(format!("unknown stream tag {v}"))),
        }
    }
}

/// A per-query identifier, chosen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(pub [u8; 16]);

impl QueryId {
    /// A fresh random id.
    pub fn random<R: rand::RngCore + ?Sized>(rng: &mut R) -> QueryId {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        QueryId(bytes)
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// The header that opens a query stream on a handshaked connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    /// Which sub-protocol this connection now carries.
    pub tag: StreamTag,
    /// The query instance.
    pub id: QueryId,
    /// The query text, carried so the receiver can parse it independently.
    pub text: String,
}

/// The reading half of a connection.
#[derive(Debug)]
pub struct ReadConn {
    reader: BufReader<OwnedReadHalf>,
    peer: Party,
}

/// The writing half of a connection.
#[derive(Debug)]
pub struct WriteConn {
    writer: BufWriter<OwnedWriteHalf>,
    peer: Party,
}

/// A handshaked connection to one remote party.
#[derive(Debug)]
pub struct Conn {
    r: ReadConn,
    w: WriteConn,
}

impl Conn {
    /// Dials `addr`, identifies as `local` and runs the lexicon exchange.
    pub async fn connect(
        addr: SocketAddr,
        local: Party,
        expected_peer: Party,
        lexicon_text: &str,
        buffer: usize,
    ) -> Result<Conn, WireError> {
        let stream = TcpStream::connect(addr).await?;
        let mut conn = Conn::from_stream(stream, expected_peer, buffer)?;
        conn.w.write_i32(local.to_int()).await?;
        conn.exchange_lexicon(lexicon_text).await?;
        Ok(conn)
    }

    /// Handshakes an accepted connection, learning who dialed us.
    pub async fn accept(
        stream: TcpStream,
        lexicon_text: &str,
        buffer: usize,
    ) -> Result<Conn, WireError> {
        let mut conn = Conn::from_stream(stream, Party::Ph, buffer)?;
        let id = conn.r.read_i32().await?;
        let peer = Party::from_int(id)
            .ok_or_else(|| WireError::BadFrame(format!("unknown party id {id}")))?;
        conn.r.peer = peer;
        conn.w.peer = peer;
        conn.exchange_lexicon(lexicon_text).await?;
        Ok(conn)
    }

    fn from_stream(stream: TcpStream, peer: Party, buffer: usize) -> Result<Conn, WireError> {
        stream.set_nodelay(true)?;
        let (r, w) = stream.into_split();
        Ok(Conn {
            r: ReadConn {
                reader: BufReader::new(r),
                peer,
            },
            w: WriteConn {
                writer: BufWriter::with_capacity(buffer, w),
                peer,
            },
        })
    }

    async fn exchange_lexicon(&mut self, lexicon_text: &str) -> Result<(), WireError> {
        self.w.write_bytes(lexicon_text.as_bytes()).await?;
        self.w.flush().await?;
        let theirs = self.r.read_bytes().await?;
        if theirs != lexicon_text.as_bytes() {
            return Err(WireError::LexiconMismatch(self.r.peer));
        }
        Ok(())
    }

    /// The party on the other end.
    pub fn peer(&self) -> Party {
        self.r.peer
    }

    /// The reading half.
    pub fn reader(&mut self) -> &mut ReadConn {
        &mut self.r
    }

    /// The writing half.
    pub fn writer(&mut self) -> &mut WriteConn {
        &mut self.w
    }

    /// Splits the connection so the halves can run in different tasks.
    pub fn into_split(self) -> (ReadConn, WriteConn) {
        (self.r, self.w)
    }

    /// Opens a query stream on this connection.
    pub async fn write_header(&mut self, header: &StreamHeader) -> Result<(), WireError> {
        self.w.write_i32(header.tag.to_int()).await?;
        self.w.writer.write_all(&header.id.0).await?;
        self.w.write_bytes(header.text.as_bytes()).await?;
        self.w.flush().await
    }

    /// Reads the header that opens the next query stream.
    pub async fn read_header(&mut self) -> Result<StreamHeader, WireError> {
        let tag = StreamTag::from_int(self.r.read_i32().await?)?;
        let mut id = [0u8; 16];
        self.r.reader.read_exact(&mut id).await?;
        let text = String::from_utf8(self.r.read_bytes().await?)
            .map_err(|_| WireError::BadFrame("query text is not utf-8".into()))?;
        Ok(StreamHeader {
            tag,
            id: QueryId(id),
            text,
        })
    }

    /// Flushes the write buffer.
    pub async fn flush(&mut self) -> Result<(), WireError> {
        self.w.flush().await
    }

    /// Flushes and shuts down the write side.
    pub async fn shutdown(&mut self) -> Result<(), WireError> {
        self.w.flush().await?;
        self.w.writer.shutdown().await?;
        Ok(())
    }
}

impl ReadConn {
    /// Reads a big-endian i32.
    pub async fn read_i32(&mut self) -> Result<i32, WireError> {
        let mut buf = [0u8; 4];
        self.reader.read_exact(&mut buf).await?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Reads a big-endian i64.
    pub async fn read_i64(&mut self) -> Result<i64, WireError> {
        let mut buf = [0u8; 8];
        self.reader.read_exact(&mut buf).await?;
        Ok(i64::from_be_bytes(buf))
    }

    /// Reads a non-negative i64 count.
    pub async fn read_count(&mut self) -> Result<u64, WireError> {
        let v = self.read_i64().await?;
        u64::try_from(v).map_err(|_| WireError::BadFrame(format!("negative count {v}")))
    }

    /// Reads a length-prefixed byte string.
    pub async fn read_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.read_i32().await?;
        if !(0..=MAX_FRAME).contains(&len) {
            return Err(WireError::BadFrame(format!("frame length {len}")));
        }
        let mut buf = vec![0u8; len as usize];
        self.reader.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Reads exactly `buf.len()` raw bytes.
    pub async fn read_raw(&mut self, buf: &mut [u8]) -> Result<(), WireError> {
        self.reader.read_exact(buf).await?;
        Ok(())
    }

    /// Reads a batch of ring elements written by [`WriteConn::write_elems`].
    pub async fn read_elems<R: Ring>(
        &mut self,
        ring: &R,
        scratch: &mut Vec<u8>,
    ) -> Result<Vec<R::Elem>, WireError> {
        let n = self.read_i32().await?;
        let width = ring.elem_size();
        let total = (0..=MAX_FRAME)
            .contains(&n)
            .then(|| (n as usize).checked_mul(width))
            .flatten()
            .ok_or_else(|| WireError::BadFrame(format!("element batch of {n}")))?;
        scratch.clear();
        scratch.resize(total, 0);
        self.reader.read_exact(scratch).await?;
        let mut out = Vec::with_capacity(n as usize);
        for chunk in scratch.chunks_exact(width) {
            out.push(
                ring.read_elem(chunk)
                    .map_err(|e| WireError::BadFrame(e.to_string()))?,
            );
        }
        Ok(out)
    }
}

impl WriteConn {
    /// Writes a big-endian i32.
    pub async fn write_i32(&mut self, v: i32) -> Result<(), WireError> {
        self.writer.write_all(&v.to_be_bytes()).await?;
        Ok(())
    }

    /// Writes a big-endian i64.
    pub async fn write_i64(&mut self, v: i64) -> Result<(), WireError> {
        self.writer.write_all(&v.to_be_bytes()).await?;
        Ok(())
    }

    /// Writes a length-prefixed byte string.
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let len = i32::try_from(bytes.len())
            .ok()
            .filter(|&l| l <= MAX_FRAME)
            .ok_or_else(|| WireError::BadFrame(format!("frame of {} bytes", bytes.len())))?;
        self.write_i32(len).await?;
        self.writer.write_all(bytes).await?;
        Ok(())
    }

    /// Writes raw bytes with no prefix.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        self.writer.write_all(bytes).await?;
        Ok(())
    }

    /// Writes a batch of ring elements: an i32 count, then the elements in
    /// the ring's fixed width.
    pub async fn write_elems<R: Ring>(
        &mut self,
        ring: &R,
        elems: &[R::Elem],
        scratch: &mut Vec<u8>,
    ) -> Result<(), WireError> {
        scratch.clear();
        for e in elems {
            ring.write_elem(e, scratch);
        }
        let n = i32::try_from(elems.len())
            .map_err(|_| WireError::BadFrame("element batch too large".into()))?;
        self.write_i32(n).await?;
        self.writer.write_all(scratch).await?;
        Ok(())
    }

    /// Flushes the write buffer. Called at sub-protocol sync points; plain
    /// writes only fill the buffer.
    pub async fn flush(&mut self) -> Result<(), WireError> {
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{SelectedRing, select_ring};
    use num_bigint::BigUint;
    use tokio::net::TcpListener;

    const LEX: &str = r#"{"common":{"modulus":"4294967291"}}"#;

    async fn pair(
        our_lex: &'static str,
        their_lex: &'static str,
    ) -> (Result<Conn, WireError>, Result<Conn, WireError>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            Conn::accept(stream, their_lex, 1 << 12).await
        });
        let dialed = Conn::connect(addr, Party::Ph, Party::Db1, our_lex, 1 << 12).await;
        (dialed, accept.await.unwrap())
    }

    #[tokio::test]
    async fn handshake_carries_the_party_id() {
        let (dialed, accepted) = pair(LEX, LEX).await;
        assert_eq!(dialed.unwrap().peer(), Party::Db1);
        assert_eq!(accepted.unwrap().peer(), Party::Ph);
    }

    #[tokio::test]
    async fn lexicon_mismatch_is_fatal() {
        let other = r#"{"common":{"modulus":"101"}}"#;
        let (dialed, accepted) = pair(LEX, other).await;
        assert!(matches!(dialed, Err(WireError::LexiconMismatch(_))));
        assert!(matches!(accepted, Err(WireError::LexiconMismatch(_))));
    }

    #[tokio::test]
    async fn headers_and_batches_round_trip() {
        let (dialed, accepted) = pair(LEX, LEX).await;
        let mut a = dialed.unwrap();
        let mut b = accepted.unwrap();

        let header = StreamHeader {
            tag: StreamTag::S2,
            id: QueryId(*b"0123456789abcdef"),
            text: "aggregate=count:years&group_by=school".into(),
        };
        a.write_header(&header).await.unwrap();
        assert_eq!(b.read_header().await.unwrap(), header);

        let SelectedRing::U64(ring) = select_ring(&BigUint::from(u64::MAX)) else {
            panic!("expected a u64 ring");
        };
        let elems = vec![0u64, 1, u64::MAX - 1];
        let mut scratch = Vec::new();
        a.writer().write_elems(&ring, &elems, &mut scratch).await.unwrap();
        a.writer().write_i64(-3).await.unwrap();
        a.flush().await.unwrap();
        assert_eq!(b.reader().read_elems(&ring, &mut scratch).await.unwrap(), elems);
        assert_eq!(b.reader().read_i64().await.unwrap(), -3);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (dialed, accepted) = pair(LEX, LEX).await;
        let mut a = dialed.unwrap();
        let mut b = accepted.unwrap();
        a.writer().write_i32(-5).await.unwrap();
        a.flush().await.unwrap();
        assert!(matches!(
            b.reader().read_bytes().await,
            Err(WireError::BadFrame(_))
        ));
    }

    #[test]
    fn query_ids_print_as_hex() {
        let id = QueryId([0xab; 16]);
        assert_eq!(id.to_string(), "ab".repeat(16));
    }
}
