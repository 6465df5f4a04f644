//! # Query Client
//!
//! Sends one `Request` over a line-oriented stream (normally the node's TCP
//! control endpoint) and folds the `Propose` replies into a private
//! [`DCache`] until the answering brain says `Pong`.
//!
//! | Outcome | When |
//! |---------|------|
//! | `Completed` | a `Pong` arrived |
//! | `Idle` | at least one reply, then `wait_since_last` of silence |
//! | `NoResponse` | nothing at all within `no_response_timeout` |
//! | `Closed` | the stream ended |
//!
//! `NoResponse` is distinct from a `Completed` query with an empty summary.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::QueryConfig;
use crate::dcache::{DCache, FactKey, Summary, TimeInterval, Timestamp};
use crate::messages::{Address, Envelope, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    Completed,
    Idle,
    NoResponse,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryReport {
    pub outcome: QueryOutcome,
    /// Well-formed envelopes read, `Pong` included.
    pub processed: usize,
    pub malformed: usize,
    pub summary: Summary,
}

pub struct QueryClient<R, W> {
    lines: Lines<R>,
    writer: W,
    config: QueryConfig,
}

impl QueryClient<BufReader<OwnedReadHalf>, OwnedWriteHalf> {
    /// Open a TCP connection to a node's control endpoint.
    pub async fn connect<A: ToSocketAddrs>(addr: A, config: QueryConfig) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self::new(BufReader::new(read), write, config))
    }
}

impl<R, W> QueryClient<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, config: QueryConfig) -> Self {
        Self {
            lines: reader.lines(),
            writer,
            config,
        }
    }

    /// Ask `target` for every live fact whose category matches `pattern`.
    pub async fn query(&mut self, pattern: &str, target: &Address) -> io::Result<QueryReport> {
        let request = Envelope::new(
            Address::anonymous_client(),
            target.clone(),
            Message::Request {
                pattern: pattern.to_string(),
                validity: TimeInterval::starting_at(Timestamp::now(), self.config.request_validity),
            },
        );
        let mut line = request.encode();
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        debug!(pattern, target = %target, "request sent");

        let started = Instant::now();
        let mut last_reply = started;
        let mut processed = 0;
        let mut malformed = 0;
        let mut cache = DCache::new();

        let outcome = loop {
            let next = tokio::time::timeout(self.config.poll_timeout, self.lines.next_line()).await;
            let line = match next {
                Err(_) => {
                    if processed == 0 && started.elapsed() >= self.config.no_response_timeout {
                        break QueryOutcome::NoResponse;
                    }
                    if processed > 0 && last_reply.elapsed() >= self.config.wait_since_last {
                        break QueryOutcome::Idle;
                    }
                    continue;
                }
                Ok(Ok(None)) => break QueryOutcome::Closed,
                Ok(Ok(Some(line))) => line,
                Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    malformed += 1;
                    warn!(error = %e, "skipping undecodable reply");
                    continue;
                }
                Ok(Err(e)) => return Err(e),
            };

            let envelope = match Envelope::decode(line.as_bytes()) {
                Ok(envelope) => envelope,
                Err(e) => {
                    malformed += 1;
                    warn!(error = %e, "skipping malformed reply");
                    continue;
                }
            };
            processed += 1;
            last_reply = Instant::now();

            match envelope.contents {
                Message::Propose { category, value, validity, origin } => {
                    if let Err(e) = cache.propose(FactKey::new(category, value), validity, origin) {
                        debug!(error = %e, "reply carried a rejected fact");
                    }
                }
                Message::Pong => break QueryOutcome::Completed,
                other => trace!(kind = other.kind(), "ignoring reply"),
            }
        };

        Ok(QueryReport {
            outcome,
            processed,
            malformed,
            summary: cache.summary(Timestamp::now()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcache::Category;
    use crate::identity::NodeId;
    use std::time::Duration;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    fn fast_config() -> QueryConfig {
        QueryConfig {
            request_validity: Duration::from_secs(5),
            poll_timeout: Duration::from_millis(20),
            wait_since_last: Duration::from_millis(150),
            no_response_timeout: Duration::from_millis(150),
        }
    }

    type TestClient = QueryClient<BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>>;

    fn pair() -> (TestClient, Lines<BufReader<ReadHalf<DuplexStream>>>, WriteHalf<DuplexStream>) {
        let (client_side, server_side) = duplex(64 * 1024);
        let (cr, cw) = split(client_side);
        let (sr, sw) = split(server_side);
        let client = QueryClient::new(BufReader::new(cr), cw, fast_config());
        (client, BufReader::new(sr).lines(), sw)
    }

    fn reply(subject: &str) -> Vec<u8> {
        let envelope = Envelope::new(
            Address::brain(NodeId::from_bytes([7; 32])),
            Address::anonymous_client(),
            Message::propose(
                FactKey::new(Category::peer(), subject),
                TimeInterval::starting_at(Timestamp::now(), Duration::from_secs(60)),
                None,
            ),
        );
        let mut line = envelope.encode();
        line.push(b'\n');
        line
    }

    fn pong() -> Vec<u8> {
        let pong = Envelope::new(Address::all_brains(), Address::anonymous_client(), Message::Pong);
        let mut line = pong.encode();
        line.push(b'\n');
        line
    }

    #[tokio::test]
    async fn pong_completes_the_query() {
        let (mut client, mut server_lines, mut server_tx) = pair();
        let server = tokio::spawn(async move {
            let line = server_lines.next_line().await.unwrap().unwrap();
            let request = Envelope::decode(line.as_bytes()).unwrap();
            assert!(matches!(
                request.contents,
                Message::Request { ref pattern, .. } if pattern == "peer"
            ));
            assert_eq!(request.maddr_to, Address::all_brains());
            server_tx.write_all(&reply("a")).await.unwrap();
            server_tx.write_all(&reply("b")).await.unwrap();
            server_tx.write_all(&pong()).await.unwrap();
            server_tx
        });

        let report = client.query("peer", &Address::all_brains()).await.unwrap();
        let _keep_open = server.await.unwrap();
        assert_eq!(report.outcome, QueryOutcome::Completed);
        assert_eq!(report.processed, 3);
        assert!(report.summary.contains("peer", "a"));
        assert!(report.summary.contains("peer", "b"));
    }

    #[tokio::test]
    async fn silence_is_no_response_not_empty() {
        let (mut client, _server_lines, _server_tx) = pair();
        let report = client.query("*", &Address::all_brains()).await.unwrap();
        assert_eq!(report.outcome, QueryOutcome::NoResponse);
        assert_eq!(report.processed, 0);
        assert!(report.summary.is_empty());
    }

    #[tokio::test]
    async fn partial_answer_goes_idle() {
        let (mut client, _server_lines, mut server_tx) = pair();
        server_tx.write_all(&reply("a")).await.unwrap();

        let report = client.query("*", &Address::all_brains()).await.unwrap();
        assert_eq!(report.outcome, QueryOutcome::Idle);
        assert_eq!(report.processed, 1);
        assert!(report.summary.contains("peer", "a"));
    }

    #[tokio::test]
    async fn end_of_stream_is_closed() {
        let (mut client, _server_lines, mut server_tx) = pair();
        server_tx.write_all(&reply("a")).await.unwrap();
        server_tx.shutdown().await.unwrap();
        drop(server_tx);

        let report = client.query("*", &Address::all_brains()).await.unwrap();
        assert_eq!(report.outcome, QueryOutcome::Closed);
        assert_eq!(report.processed, 1);
    }

    #[tokio::test]
    async fn malformed_reply_is_skipped() {
        let (mut client, _server_lines, mut server_tx) = pair();
        server_tx.write_all(&reply("a")).await.unwrap();
        server_tx.write_all(b"{\"maddr_from\": \n").await.unwrap();
        server_tx.write_all(&reply("b")).await.unwrap();
        server_tx.write_all(&pong()).await.unwrap();

        let report = client.query("*", &Address::all_brains()).await.unwrap();
        assert_eq!(report.outcome, QueryOutcome::Completed);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.summary.fact_count(), 2);
    }

    #[test]
    fn report_serializes_outcome_in_snake_case() {
        let report = QueryReport {
            outcome: QueryOutcome::NoResponse,
            processed: 0,
            malformed: 0,
            summary: Summary::default(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "no_response");
        assert_eq!(json["processed"], 0);
    }
}
