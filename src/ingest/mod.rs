//! TCP feed ingest
//!
//! Each game server keeps one connection open to the engine. The first line
//! identifies the server (`<server id>;<game>;<map name>`); every line after
//! that is either a lifecycle verb handled here (`JC` client joined, `QC`
//! client quit, `MS` match started, `ME` match ended) or a raw script-event
//! line handed to the parser. Lines are handled strictly in order: a line is
//! fully parsed, processed, and flushed before the next one is read.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{EventParser, EventProcessor, Game, GameEvent, ServerContext};
use crate::state::records::EventLogType;
use crate::state::ClientStateManager;
use crate::store::StatsGateway;

const DATA_SEPARATOR: char = ';';

/// Accept loop. Spawns one session task per game-server connection and exits
/// when the shutdown signal fires.
pub async fn run_listener<G: StatsGateway + 'static>(
    listener: TcpListener,
    processor: Arc<EventProcessor<G>>,
    manager: Arc<ClientStateManager<G>>,
    shutdown: watch::Receiver<bool>,
) {
    let mut shutdown_rx = shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("feed listener shutting down");
                    return;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let session_id = Uuid::new_v4();
                        info!(%peer, %session_id, "game server feed connected");
                        let processor = Arc::clone(&processor);
                        let manager = Arc::clone(&manager);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(err) =
                                run_session(stream, processor, manager, shutdown).await
                            {
                                warn!(%session_id, error = %err, "feed session ended with error");
                            }
                            info!(%session_id, "game server feed closed");
                        });
                    }
                    Err(err) => warn!(error = %err, "failed to accept feed connection"),
                }
            }
        }
    }
}

/// Drive one connection to completion. Generic over the stream so tests can
/// feed it an in-memory duplex.
async fn run_session<G, S>(
    stream: S,
    processor: Arc<EventProcessor<G>>,
    manager: Arc<ClientStateManager<G>>,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()>
where
    G: StatsGateway,
    S: AsyncRead + Unpin + Send,
{
    let mut lines = BufReader::new(stream).lines();

    let Some(hello) = lines.next_line().await? else {
        return Ok(());
    };
    let context = match parse_hello(&hello) {
        Ok(context) => context,
        Err(reason) => {
            warn!(line = %hello, reason = %reason, "rejecting feed connection with bad hello");
            return Ok(());
        }
    };
    info!(
        server_id = context.server_id,
        game = %context.game,
        map = context.map_name.as_deref().unwrap_or("-"),
        "game server registered"
    );
    manager
        .register_server(context.server_id, context.game, context.map_name.clone())
        .await;
    let parser = EventParser::new(context.game);

    while let Some(line) = lines.next_line().await? {
        if *shutdown.borrow() {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        handle_line(line, &parser, &processor, &manager, &context).await;
        manager.update_state(&shutdown).await;
    }

    Ok(())
}

async fn handle_line<G: StatsGateway>(
    line: &str,
    parser: &EventParser,
    processor: &EventProcessor<G>,
    manager: &ClientStateManager<G>,
    context: &ServerContext,
) {
    let fields: Vec<&str> = line.split(DATA_SEPARATOR).collect();
    let verb = fields.get(1).copied().unwrap_or_default();

    match verb {
        "JC" => match parser.parse_client_identity(&fields[2..]) {
            Ok(client) => {
                if let Err(err) = manager.track_client(&client, context.server_id).await {
                    error!(error = %err, client = %client, "failed to attach client to match");
                    return;
                }
                let mut live = manager.live().await;
                manager.track_event_for_log(
                    &mut live,
                    context.server_id,
                    EventLogType::JoinedMatch,
                    Some(&client),
                    None,
                    None,
                    None,
                );
            }
            Err(err) => warn!(error = %err, line, "dropping malformed client join"),
        },
        "QC" => match parser.parse_client_identity(&fields[2..]) {
            Ok(client) => {
                {
                    let mut live = manager.live().await;
                    manager.track_event_for_log(
                        &mut live,
                        context.server_id,
                        EventLogType::LeftMatch,
                        Some(&client),
                        None,
                        None,
                        None,
                    );
                }
                // A quitting client forfeits the round in progress; an empty
                // round-data event closes out their counters before detach.
                processor
                    .process_event(
                        GameEvent::PlayerRoundData {
                            client: client.clone(),
                            total_score: 0,
                            current_score: 0,
                            current_round: 0,
                            is_game_over: false,
                        },
                        context,
                    )
                    .await;
                manager.untrack_client(&client, context.server_id).await;
            }
            Err(err) => warn!(error = %err, line, "dropping malformed client quit"),
        },
        "MS" => {
            let empty = manager.live().await.roster_size(context.server_id) == 0;
            if empty {
                debug!(
                    server_id = context.server_id,
                    "ignoring match start with no connected clients"
                );
                return;
            }
            manager.create_match(context.server_id).await;
            let mut live = manager.live().await;
            manager.track_event_for_log(
                &mut live,
                context.server_id,
                EventLogType::MatchStarted,
                None,
                None,
                None,
                None,
            );
        }
        "ME" => {
            {
                let mut live = manager.live().await;
                manager.track_event_for_log(
                    &mut live,
                    context.server_id,
                    EventLogType::MatchEnded,
                    None,
                    None,
                    None,
                    None,
                );
            }
            manager.end_match(context.server_id).await;
        }
        _ => match parser.parse_script_event(line) {
            Ok(Some(event)) => processor.process_event(event, context).await,
            Ok(None) => {}
            Err(err) => warn!(error = %err, line, "dropping unparseable script event"),
        },
    }
}

fn parse_hello(line: &str) -> Result<ServerContext, String> {
    let fields: Vec<&str> = line.trim().split(DATA_SEPARATOR).collect();
    if fields.len() < 2 {
        return Err("expected <server id>;<game>;<map name>".to_string());
    }
    let server_id = fields[0]
        .trim()
        .parse::<i64>()
        .map_err(|_| format!("bad server id '{}'", fields[0]))?;
    let game = fields[1].trim().parse::<Game>()?;
    let map_name = fields
        .get(2)
        .map(|map| map.trim())
        .filter(|map| !map.is_empty())
        .map(str::to_string);

    Ok(ServerContext {
        server_id,
        game,
        map_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::records::{TABLE_EVENT_LOGS, TABLE_MATCHES};
    use crate::store::MemoryGateway;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    async fn drive(lines: &str) -> Arc<ClientStateManager<MemoryGateway>> {
        let manager = Arc::new(ClientStateManager::new(MemoryGateway::new()));
        let (tx, _synthetic_rx) = mpsc::unbounded_channel();
        let processor = Arc::new(EventProcessor::new(Arc::clone(&manager), tx));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(run_session(
            server,
            processor,
            Arc::clone(&manager),
            shutdown_rx,
        ));

        // The session may hang up early (bad hello); write errors are fine.
        let mut client = client;
        let _ = client.write_all(lines.as_bytes()).await;
        let _ = client.shutdown().await;
        drop(client);
        session.await.unwrap().unwrap();
        manager
    }

    #[tokio::test]
    async fn hello_registers_server_and_join_creates_match() {
        let manager = drive("1;T6;zm_transit\n100;JC;1001;0;allies;alice\n").await;

        let mut live = manager.live().await;
        assert!(live.match_for_server(1).is_some());
        assert_eq!(live.tracked_clients(), 1);
        assert_eq!(live.server_game(1), Some(Game::T6));
    }

    #[tokio::test]
    async fn bad_hello_closes_session_without_registering() {
        let manager = drive("not-a-server-id;T6;zm_transit\n100;JC;1001;0;allies;alice\n").await;

        let live = manager.live().await;
        assert_eq!(live.server_game(1), None);
        assert_eq!(live.active_matches(), 0);
    }

    #[tokio::test]
    async fn quit_forfeits_round_and_detaches_client() {
        let manager = drive(
            "1;T6;zm_transit\n\
             100;JC;1001;0;allies;alice\n\
             101;QC;1001;0;allies;alice\n",
        )
        .await;

        let mut live = manager.live().await;
        assert_eq!(live.tracked_clients(), 0);
        // The match outlives the quit; only the client is detached.
        assert!(live.match_for_server(1).is_some());
        assert!(live.match_for_server(1).unwrap().round_states.is_empty());
    }

    #[tokio::test]
    async fn match_start_with_empty_roster_is_ignored() {
        let manager = drive("1;T6;zm_transit\n100;MS\n").await;

        let live = manager.live().await;
        assert_eq!(live.active_matches(), 0);
    }

    #[tokio::test]
    async fn match_lifecycle_flushes_logs_and_rows() {
        let manager = drive(
            "1;T6;zm_transit\n\
             100;JC;1001;0;allies;alice\n\
             101;ME\n",
        )
        .await;

        let gateway = manager.gateway();
        assert_eq!(gateway.row_count(TABLE_MATCHES), 1);
        // JoinedMatch + MatchEnded.
        assert_eq!(gateway.row_count(TABLE_EVENT_LOGS), 2);
        assert_eq!(manager.live().await.active_matches(), 0);
    }

    #[tokio::test]
    async fn script_lines_reach_the_processor() {
        let manager = drive(
            "1;T6;zm_transit\n\
             100;JC;1001;0;allies;alice\n\
             101;AK;0;-1;axis;Zombie;1001;0;allies;alice;ray_gun_zm;999;MOD_RIFLE_BULLET;head\n",
        )
        .await;

        let mut live = manager.live().await;
        let state = live.match_for_server(1).unwrap();
        let round = state.round_states[&1001].record.lock();
        assert_eq!(round.totals.kills, 1);
        assert_eq!(round.totals.headshots, 1);
    }

    #[tokio::test]
    async fn unparseable_lines_are_skipped_without_closing_the_session() {
        let manager = drive(
            "1;T6;zm_transit\n\
             100;SU;1001;0;allies;alice;headshots;?5\n\
             101;JC;1001;0;allies;alice\n",
        )
        .await;

        let mut live = manager.live().await;
        assert!(live.match_for_server(1).is_some());
        assert_eq!(live.tracked_clients(), 1);
    }

    #[test]
    fn hello_map_name_is_optional() {
        let context = parse_hello("7;IW4").unwrap();
        assert_eq!(context.server_id, 7);
        assert_eq!(context.game, Game::IW4);
        assert_eq!(context.map_name, None);

        assert!(parse_hello("7;QUAKE;map").is_err());
    }
}
