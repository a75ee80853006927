use std::sync::Arc;
use std::time::Duration;

use clap::{App, Arg};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{event, Level};

use crate::cbor::{CborEncoder, CodecError};
use crate::protocol::common::Point;
use crate::protocol::keepalive::{KeepAliveClient, KeepAliveServer};
use crate::protocol::localstatequery::queries::{
    chain_block_no_to_cbor, chain_point_to_cbor, BLOCK_QUERY_TYPE_HARD_FORK,
};
use crate::protocol::localstatequery::{
    AcquireFailure, AcquireOutcome, LocalStateQueryClient, LocalStateQueryConfig,
    LocalStateQueryServer, Query, QueryError, SystemStart,
};
use crate::protocol::muxer::MemoryMuxer;
use crate::protocol::{ProtocolError, ProtocolOptions};
use crate::settings::Settings;

///
/// The entry point to the node runtime. Parses the command line, loads the
/// settings and runs a client and a server over a loopback connection until
/// ctrl-c or the configured run time elapses.
///
pub async fn run() -> crate::Result<()> {
    //
    // handle command-line arguments
    //
    let matches = App::new("Ouroboros Node")
        .about("Runs keep-alive and local-state-query over a loopback connection")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("config file name"),
        )
        .arg(
            Arg::with_name("run_secs")
                .short("t")
                .long("run_secs")
                .takes_value(true)
                .help("stop after this many seconds"),
        )
        .get_matches();

    let config_name = match matches.value_of("config") {
        Some(name) => name,
        None => "config",
    };
    let mut settings = Settings::load(config_name)?;
    if let Some(run_secs) = matches.value_of("run_secs") {
        settings.node.run_secs = Some(run_secs.parse()?);
    }

    //
    // handle shutdown messages w/ broadcast channel
    //
    let (notify_shutdown, _) = broadcast::channel(1);
    let node = Node::new(settings, notify_shutdown.clone());

    tokio::select! {
        res = node.run() => {
            if let Err(err) = res {
                event!(Level::ERROR, "{}", err);
            }
        },
        _ = signal::ctrl_c() => {
            event!(Level::INFO, "shutting down");
        }
    }
    let _ = notify_shutdown.send(());

    Ok(())
}

///
/// Chain state served by the local-state-query server.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerState {
    pub tip: Point,
    pub block_no: Option<u64>,
    pub system_start: SystemStart,
    pub era: u64,
}

impl Default for LedgerState {
    fn default() -> Self {
        LedgerState {
            tip: Point::origin(),
            block_no: None,
            system_start: SystemStart {
                year: 2017,
                day: 266,
                picoseconds: 0,
            },
            era: 0,
        }
    }
}

impl LedgerState {
    pub fn acquire(&self, point: Option<&Point>) -> AcquireOutcome {
        match point {
            None => AcquireOutcome::Acquired,
            Some(point) if *point == self.tip => AcquireOutcome::Acquired,
            Some(point) if point.slot > self.tip.slot => {
                AcquireOutcome::Failure(AcquireFailure::PointNotOnChain)
            }
            // only the tip is kept
            Some(_) => AcquireOutcome::Failure(AcquireFailure::PointTooOld),
        }
    }

    pub fn answer(&self, query: &Query) -> crate::Result<Vec<u8>> {
        let result = match query {
            Query::GetSystemStart => self.system_start.to_cbor()?,
            Query::GetChainBlockNo => chain_block_no_to_cbor(self.block_no)?,
            Query::GetChainPoint => chain_point_to_cbor(&self.tip)?,
            Query::Block(block_query) => {
                if block_query.block_query_type() != Some(BLOCK_QUERY_TYPE_HARD_FORK) {
                    return Err(format!("unsupported block query: {}", hex::encode(block_query.raw())).into());
                }
                let mut encoder = CborEncoder::new(Vec::new());
                encoder.u64(self.era).map_err(CodecError::from)?;
                encoder.into_writer()
            }
        };
        Ok(result)
    }
}

/// What the client learned from one round of queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySummary {
    pub system_start: SystemStart,
    pub era: u64,
    pub block_no: Option<Option<u64>>,
    pub tip: Option<Point>,
}

//
// A node runs both ends of a loopback connection: the keep-alive pair and
// the local-state-query pair share one muxer and one error channel.
//
pub struct Node {
    settings: Settings,
    ledger: Arc<LedgerState>,
    notify_shutdown: broadcast::Sender<()>,
}

impl Node {
    pub fn new(settings: Settings, notify_shutdown: broadcast::Sender<()>) -> Self {
        Node {
            settings,
            ledger: Arc::new(LedgerState {
                tip: Point::new(4492800, vec![0xf8; 32]),
                block_no: Some(4490511),
                era: 5,
                ..LedgerState::default()
            }),
            notify_shutdown,
        }
    }

    pub fn with_ledger(mut self, ledger: LedgerState) -> Self {
        self.ledger = Arc::new(ledger);
        self
    }

    pub async fn run(&self) -> crate::Result<()> {
        let (client_muxer, server_muxer) = MemoryMuxer::pair();
        let (error_sender, mut errors) = mpsc::unbounded_channel();
        let version = self.settings.local_state_query.version;
        let client_options = ProtocolOptions::new(
            Arc::new(client_muxer),
            error_sender.clone(),
            self.notify_shutdown.clone(),
            version,
        );
        let server_options = ProtocolOptions::new(
            Arc::new(server_muxer),
            error_sender,
            self.notify_shutdown.clone(),
            version,
        );

        //
        // keep-alive
        //
        let keep_alive_server =
            KeepAliveServer::new(server_options.clone(), self.settings.keep_alive_config())?;
        let keep_alive_client = KeepAliveClient::new(
            client_options.clone(),
            self.settings
                .keep_alive_config()
                .with_response_callback(Arc::new(|cookie: u16| -> crate::Result<()> {
                    event!(Level::INFO, "keep-alive response {:#06x}", cookie);
                    Ok(())
                })),
        )?;
        keep_alive_server.start();
        keep_alive_client.start().await?;

        //
        // local-state-query
        //
        let server_config =
            serve_ledger(self.settings.local_state_query_config(), self.ledger.clone());
        let query_server = LocalStateQueryServer::new(server_options, server_config)?;
        let query_client =
            LocalStateQueryClient::new(client_options, self.settings.local_state_query_config())?;
        query_server.start();
        query_client.start();

        let summary = query_ledger(&query_client).await?;
        event!(
            Level::INFO,
            "system start {}-{}, era {}, block {:?}, tip {:?}",
            summary.system_start.year,
            summary.system_start.day,
            summary.era,
            summary.block_no,
            summary.tip
        );
        query_client.done().await?;

        //
        // keep the connection alive until the run time elapses
        //
        let deadline = self.settings.node.run_secs.map(Duration::from_secs);
        let run_time = async {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(run_time);
        loop {
            tokio::select! {
                Some(err) = errors.recv() => log_error(&err),
                _ = &mut run_time => break,
            }
        }

        keep_alive_client.stop().await?;
        Ok(())
    }
}

/// Attach callbacks answering from `ledger` to a server config.
pub fn serve_ledger(config: LocalStateQueryConfig, ledger: Arc<LedgerState>) -> LocalStateQueryConfig {
    let acquire_ledger = ledger.clone();
    let reacquire_ledger = ledger.clone();
    config
        .with_acquire(Arc::new(move |point: Option<Point>| -> crate::Result<AcquireOutcome> {
            Ok(acquire_ledger.acquire(point.as_ref()))
        }))
        .with_reacquire(Arc::new(move |point: Option<Point>| -> crate::Result<AcquireOutcome> {
            Ok(reacquire_ledger.acquire(point.as_ref()))
        }))
        .with_query(Arc::new(move |query: Query| -> crate::Result<Vec<u8>> {
            ledger.answer(&query)
        }))
        .with_release(Arc::new(|| -> crate::Result<()> { Ok(()) }))
        .with_done(Arc::new(|| -> crate::Result<()> {
            event!(Level::DEBUG, "local-state-query client is done");
            Ok(())
        }))
}

///
/// Runs the standard queries against the acquired tip. Queries above the
/// negotiated version are skipped.
///
pub async fn query_ledger(client: &LocalStateQueryClient) -> Result<QuerySummary, QueryError> {
    let system_start = client.get_system_start().await?;
    let era = client.get_current_era().await?;
    let block_no = skip_unsupported(client.get_chain_block_no().await)?;
    let tip = skip_unsupported(client.get_chain_point().await)?;
    Ok(QuerySummary {
        system_start,
        era,
        block_no,
        tip,
    })
}

fn skip_unsupported<T>(result: Result<T, QueryError>) -> Result<Option<T>, QueryError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(QueryError::Protocol(err @ ProtocolError::UnsupportedFeature { .. })) => {
            event!(Level::WARN, "{}", err);
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn log_error(err: &ProtocolError) {
    match err {
        ProtocolError::Timeout { .. } | ProtocolError::TransportClosed { .. } => {
            event!(Level::WARN, "{}", err)
        }
        _ => event!(Level::ERROR, "{}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::localstatequery::BlockQuery;

    fn ledger() -> LedgerState {
        LedgerState {
            tip: Point::new(100, vec![1; 32]),
            block_no: Some(42),
            era: 6,
            ..LedgerState::default()
        }
    }

    #[test]
    fn ledger_acquires_only_the_tip() {
        let ledger = ledger();
        assert_eq!(ledger.acquire(None), AcquireOutcome::Acquired);
        assert_eq!(
            ledger.acquire(Some(&Point::new(100, vec![1; 32]))),
            AcquireOutcome::Acquired
        );
        assert_eq!(
            ledger.acquire(Some(&Point::new(99, vec![1; 32]))),
            AcquireOutcome::Failure(AcquireFailure::PointTooOld)
        );
        assert_eq!(
            ledger.acquire(Some(&Point::new(101, vec![1; 32]))),
            AcquireOutcome::Failure(AcquireFailure::PointNotOnChain)
        );
    }

    #[test]
    fn ledger_answers_current_era_only_among_block_queries() {
        let ledger = ledger();
        assert_eq!(ledger.answer(&Query::Block(BlockQuery::current_era())).unwrap(), vec![0x06]);
        assert!(ledger.answer(&Query::Block(BlockQuery::shelley(5, 1).unwrap())).is_err());
    }

    async fn summary_at(version: u16) -> QuerySummary {
        let (a, b) = MemoryMuxer::pair();
        let (error_sender, _errors) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        let server = LocalStateQueryServer::new(
            ProtocolOptions::new(Arc::new(b), error_sender.clone(), shutdown.clone(), version),
            serve_ledger(LocalStateQueryConfig::default(), Arc::new(ledger())),
        )
        .unwrap();
        let client = LocalStateQueryClient::new(
            ProtocolOptions::new(Arc::new(a), error_sender, shutdown, version),
            LocalStateQueryConfig::default(),
        )
        .unwrap();
        server.start();
        client.start();
        let summary = query_ledger(&client).await.unwrap();
        client.done().await.unwrap();
        summary
    }

    #[tokio::test]
    async fn queries_everything_at_current_version() {
        let summary = summary_at(11).await;
        assert_eq!(summary.system_start.year, 2017);
        assert_eq!(summary.era, 6);
        assert_eq!(summary.block_no, Some(Some(42)));
        assert_eq!(summary.tip, Some(Point::new(100, vec![1; 32])));
    }

    #[tokio::test]
    async fn skips_queries_the_version_lacks() {
        let summary = summary_at(9).await;
        assert_eq!(summary.era, 6);
        assert_eq!(summary.block_no, None);
        assert_eq!(summary.tip, None);
    }

    #[tokio::test(start_paused = true)]
    async fn node_runs_until_run_time_elapses() {
        let mut settings = Settings::default();
        settings.node.run_secs = Some(5);
        settings.keep_alive.period_secs = 1;
        let (shutdown, _) = broadcast::channel(1);
        let node = Node::new(settings, shutdown).with_ledger(ledger());
        node.run().await.unwrap();
    }
}
