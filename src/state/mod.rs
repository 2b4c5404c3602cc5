//! Live match/round/client state and its persistence discipline
//!
//! One [`ClientStateManager`] owns everything mutable: the per-server match
//! map, the (client, game) index into it, the caches loaded at startup, and
//! the persistence queue. A single structural lock (the "working" guard)
//! protects the maps; it is a `tokio::sync::Mutex` because it is held across
//! gateway awaits during client tracking and flush.

pub mod match_state;
pub mod queue;
pub mod records;

pub use match_state::{MatchState, RoundState};
pub use queue::PersistenceQueue;

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::events::{ClientIdentity, Game};
use crate::store::{GatewayError, StatsGateway};

use records::{
    shared, AggregateStatRecord, EventLogRecord, EventLogType, MatchClientStatRecord, MatchRecord,
    NumericalRecord, QueuedRecord, RecordMeta, RoundStatRecord, Shared, StatTagRecord,
    StatTagValueRecord, RECORD_TYPE_MAXIMUM,
};

/// Connected clients for one registered game server. Maintained by
/// track/untrack so match creation and round rollover can attach everyone
/// currently on the server.
pub struct ServerRoster {
    pub game: Game,
    pub map_name: Option<String>,
    pub clients: HashMap<i64, ClientIdentity>,
}

/// Everything behind the structural lock.
#[derive(Default)]
pub struct LiveState {
    /// Active match per server.
    matches: HashMap<i64, MatchState>,
    /// Ended matches kept around until the next match on the same server
    /// consumes their lifetime state.
    recently_ended: Vec<MatchState>,
    /// (network id, game) -> server id of the match the client is in.
    client_matches: HashMap<(i64, Game), i64>,
    rosters: HashMap<i64, ServerRoster>,
    /// All-time maximum records keyed by metric name.
    records_cache: HashMap<String, Vec<Shared<NumericalRecord>>>,
    /// Stat-tag definitions keyed by tag name.
    tag_cache: HashMap<String, Shared<StatTagRecord>>,
}

impl LiveState {
    pub fn state_for_client(&mut self, network_id: i64, game: Game) -> Option<&mut MatchState> {
        let server_id = *self.client_matches.get(&(network_id, game))?;
        self.matches.get_mut(&server_id)
    }

    pub fn match_for_server(&mut self, server_id: i64) -> Option<&mut MatchState> {
        self.matches.get_mut(&server_id)
    }

    pub fn server_game(&self, server_id: i64) -> Option<Game> {
        self.rosters.get(&server_id).map(|roster| roster.game)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.client_matches.len()
    }

    pub fn roster_size(&self, server_id: i64) -> usize {
        self.rosters
            .get(&server_id)
            .map(|roster| roster.clients.len())
            .unwrap_or(0)
    }
}

pub struct ClientStateManager<G> {
    gateway: G,
    queue: PersistenceQueue,
    live: tokio::sync::Mutex<LiveState>,
}

impl<G: StatsGateway> ClientStateManager<G> {
    pub fn new(gateway: G) -> Self {
        Self {
            gateway,
            queue: PersistenceQueue::new(),
            live: tokio::sync::Mutex::new(LiveState::default()),
        }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Structural lock over the live maps. Event handlers take this once per
    /// event and pass the guard into the synchronous accessors below.
    pub async fn live(&self) -> tokio::sync::MutexGuard<'_, LiveState> {
        self.live.lock().await
    }

    /// Load the record and tag caches. Called once before any events flow.
    pub async fn initialize(&self) -> Result<(), GatewayError> {
        let record_rows = self.gateway.load_numerical_records().await?;
        let tag_rows = self.gateway.load_stat_tags().await?;

        let mut live = self.live.lock().await;
        for record in record_rows {
            live.records_cache
                .entry(record.name.clone())
                .or_default()
                .push(shared(record));
        }
        for tag in tag_rows {
            live.tag_cache.insert(tag.tag_name.clone(), shared(tag));
        }

        debug!(
            records = live.records_cache.len(),
            tags = live.tag_cache.len(),
            "loaded persistent caches"
        );
        Ok(())
    }

    /// Register a server feed before any of its clients are tracked.
    pub async fn register_server(&self, server_id: i64, game: Game, map_name: Option<String>) {
        let mut live = self.live.lock().await;
        live.rosters.insert(
            server_id,
            ServerRoster {
                game,
                map_name,
                clients: HashMap::new(),
            },
        );
    }

    /// Attach a client to the active match on a server, creating the match
    /// if the join arrives before the match-start signal.
    pub async fn track_client(
        &self,
        client: &ClientIdentity,
        server_id: i64,
    ) -> Result<(), GatewayError> {
        let mut live = self.live.lock().await;

        let Some(roster) = live.rosters.get_mut(&server_id) else {
            warn!(server_id, "cannot track client on unregistered server");
            return Ok(());
        };
        let game = roster.game;
        roster.clients.insert(client.network_id, client.clone());

        if !live.matches.contains_key(&server_id) {
            warn!(server_id, "no active horde match for server");
            self.create_match_locked(&mut live, server_id);
        }

        debug!(client = %client, server_id, "adding client to existing match");
        self.add_player_to_match(&mut live, server_id, client).await?;

        live.client_matches.insert((client.network_id, game), server_id);
        Ok(())
    }

    /// Detach a client from its match and the server roster.
    pub async fn untrack_client(&self, client: &ClientIdentity, server_id: i64) {
        let mut live = self.live.lock().await;

        let game = live.rosters.get(&server_id).map(|r| r.game).or(client.game);
        if let Some(roster) = live.rosters.get_mut(&server_id) {
            roster.clients.remove(&client.network_id);
        }

        let Some(match_state) = live.matches.get_mut(&server_id) else {
            return;
        };

        debug!(client = %client, "removing client from state tracking");
        match_state.remove_client(client.network_id);

        if let Some(game) = game {
            live.client_matches.remove(&(client.network_id, game));
        }
    }

    pub async fn create_match(&self, server_id: i64) {
        let mut live = self.live.lock().await;
        self.create_match_locked(&mut live, server_id);
    }

    fn create_match_locked(&self, live: &mut LiveState, server_id: i64) {
        if live.matches.contains_key(&server_id) {
            warn!(server_id, "cannot create a new horde match, one already in progress");
            return;
        }

        let Some(roster) = live.rosters.get(&server_id) else {
            warn!(server_id, "cannot create horde match for unregistered server");
            return;
        };
        let game = roster.game;
        let map_name = roster.map_name.clone();
        let rostered: Vec<ClientIdentity> = roster.clients.values().cloned().collect();

        debug!(server_id, "creating horde match");

        let record = shared(MatchRecord::new(server_id, map_name));
        let mut match_state = MatchState::new(server_id, game, record.clone());

        // lifetime state survives across back-to-back matches on one server
        if let Some(pos) = live
            .recently_ended
            .iter()
            .position(|m| m.server_id == server_id)
        {
            let previous = live.recently_ended.remove(pos);
            match_state.lifetime_stats.extend(previous.lifetime_stats);
            match_state
                .lifetime_server_stats
                .extend(previous.lifetime_server_stats);
            match_state.tag_values.extend(previous.tag_values);
        }

        for client in rostered {
            debug!(client = %client, "adding connected client to new horde match");
            live.client_matches.insert((client.network_id, game), server_id);
            self.carry_over_player(&mut match_state, &client);
        }

        live.matches.insert(server_id, match_state);
        self.queue.track_new(QueuedRecord::Match(record));
        self.start_next_round(live, server_id, 1);
    }

    fn carry_over_player(&self, match_state: &mut MatchState, client: &ClientIdentity) {
        debug!(client = %client, "client is carrying over from the last match");
        let network_id = client.network_id;

        let match_stat = shared(MatchClientStatRecord::new(
            network_id,
            match_state.record.clone(),
        ));
        self.queue
            .track_new(QueuedRecord::MatchClientStat(match_stat.clone()));
        match_state.match_stats.insert(network_id, match_stat);

        if let Some(stats) = match_state.lifetime_stats.get(&network_id) {
            stats.lock().total_matches_played += 1;
        }
        if let Some(stats) = match_state.lifetime_server_stats.get(&network_id) {
            stats.lock().total_matches_played += 1;
        }
    }

    async fn add_player_to_match(
        &self,
        live: &mut LiveState,
        server_id: i64,
        client: &ClientIdentity,
    ) -> Result<(), GatewayError> {
        debug!(client = %client, "adding client to horde match");
        let network_id = client.network_id;

        let (match_record, match_db_id, round_number) = {
            let Some(match_state) = live.matches.get(&server_id) else {
                return Ok(());
            };
            let db_id = match_state.record.lock().meta.id;
            (match_state.record.clone(), db_id, match_state.round_number)
        };

        let existing_aggregates = self.gateway.load_aggregates_for_client(network_id).await?;

        let loaded_match_stat = match match_db_id {
            Some(match_id) => self.gateway.load_match_client_stat(network_id, match_id).await?,
            None => None,
        };
        let has_connected_previously = loaded_match_stat.is_some();

        let mut match_stat = loaded_match_stat.map(|mut row| {
            row.match_ref = Some(match_record.clone());
            shared(row)
        });
        if match_stat.is_none() {
            match_stat = live
                .matches
                .get(&server_id)
                .and_then(|m| m.match_stats.get(&network_id))
                .cloned();
        }
        let match_stat = match match_stat {
            Some(existing) => {
                debug!(client = %client, round_number, "connecting client has existing data for this match");
                existing
            }
            None => {
                let row = shared(MatchClientStatRecord::new(network_id, match_record.clone()));
                self.queue
                    .track_new(QueuedRecord::MatchClientStat(row.clone()));
                row
            }
        };

        let has_round_state = live
            .matches
            .get(&server_id)
            .map(|m| m.round_states.contains_key(&network_id))
            .unwrap_or(false);
        let round_state = if has_round_state {
            None
        } else {
            let loaded_round = match match_db_id {
                Some(match_id) => {
                    self.gateway
                        .load_round_stat(network_id, match_id, round_number)
                        .await?
                }
                None => None,
            };
            let record = match loaded_round {
                Some(mut row) => {
                    debug!(client = %client, round_number, "connecting client has existing data for this round");
                    row.match_ref = Some(match_record.clone());
                    shared(row)
                }
                None => {
                    let row = shared(RoundStatRecord::new(network_id, match_record.clone(), 1));
                    self.queue.track_new(QueuedRecord::Round(row.clone()));
                    row
                }
            };
            Some(RoundState::new(record))
        };

        let lifetime = match existing_aggregates.iter().find(|a| a.server_id.is_none()) {
            Some(row) => {
                let row = shared(row.clone());
                if !has_connected_previously {
                    row.lock().total_matches_played += 1;
                }
                row
            }
            None => {
                let mut row = AggregateStatRecord::new(network_id, None);
                row.total_matches_played = 1;
                let row = shared(row);
                self.queue.track_new(QueuedRecord::Aggregate(row.clone()));
                row
            }
        };

        let lifetime_server = match existing_aggregates
            .iter()
            .find(|a| a.server_id == Some(server_id))
        {
            Some(row) => {
                let row = shared(row.clone());
                if !has_connected_previously {
                    row.lock().total_matches_played += 1;
                }
                row
            }
            None => {
                let mut row = AggregateStatRecord::new(network_id, Some(server_id));
                row.total_matches_played = 1;
                let row = shared(row);
                self.queue.track_new(QueuedRecord::Aggregate(row.clone()));
                row
            }
        };

        let tag_rows = self.gateway.load_tag_values_for_client(network_id).await?;
        let mut tag_values = HashMap::new();
        for (tag_name, mut row) in tag_rows {
            row.tag_ref = live.tag_cache.get(&tag_name).cloned();
            tag_values.insert(tag_name, shared(row));
        }

        let Some(match_state) = live.matches.get_mut(&server_id) else {
            return Ok(());
        };
        match_state.match_stats.insert(network_id, match_stat);
        if let Some(round_state) = round_state {
            match_state.round_states.insert(network_id, round_state);
        }
        match_state.lifetime_stats.insert(network_id, lifetime);
        match_state
            .lifetime_server_stats
            .insert(network_id, lifetime_server);
        match_state.tag_values.insert(network_id, tag_values);
        Ok(())
    }

    /// Roll the match to `round`. Replays and stale numbers are no-ops.
    pub fn start_next_round(&self, live: &mut LiveState, server_id: i64, round: i32) {
        if !live.matches.contains_key(&server_id) {
            warn!(server_id, "cannot start next round, no active match");
            return;
        }

        let game = live.matches.get(&server_id).map(|m| m.game);
        let eligible: Vec<i64> = live
            .rosters
            .get(&server_id)
            .map(|roster| roster.clients.keys().copied().collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .filter(|network_id| {
                game.map(|game| live.client_matches.contains_key(&(*network_id, game)))
                    .unwrap_or(false)
            })
            .collect();

        let Some(match_state) = live.matches.get_mut(&server_id) else {
            return;
        };

        if match_state.round_number >= round {
            return;
        }

        debug!(round, server_id, "starting round");
        match_state.round_number = round;
        match_state.round_states.clear();

        for network_id in eligible {
            debug!(network_id, "updating current round");

            let record = shared(RoundStatRecord::new(
                network_id,
                match_state.record.clone(),
                round,
            ));

            if let Some(stats) = match_state.match_stats.get(&network_id) {
                let mut stats = stats.lock();
                if stats.joined_round.is_none() {
                    stats.joined_round = Some(round);
                }
            }

            self.queue.track_new(QueuedRecord::Round(record.clone()));
            match_state
                .round_states
                .insert(network_id, RoundState::new(record));
        }
    }

    /// Stamp the end time and park the match for carry-over.
    pub async fn end_match(&self, server_id: i64) {
        let mut live = self.live.lock().await;

        let Some(match_state) = live.matches.remove(&server_id) else {
            warn!(server_id, "cannot end horde match, server has not started one");
            return;
        };

        debug!(server_id, "ending horde match");
        match_state.record.lock().match_end = Some(Utc::now());
        self.queue
            .track_updated(QueuedRecord::Match(match_state.record.clone()));

        live.client_matches.retain(|_, sid| *sid != server_id);
        live.recently_ended.push(match_state);
    }

    /// Current tag value for a client, creating the tag definition and the
    /// value row lazily. `None` when the client has no match context.
    pub fn stat_tag_value_for_client(
        &self,
        live: &mut LiveState,
        client: &ClientIdentity,
        fallback: Game,
        tag_name: &str,
    ) -> Option<Shared<StatTagValueRecord>> {
        let tag = match live.tag_cache.get(tag_name) {
            Some(tag) => tag.clone(),
            None => {
                debug!(tag = tag_name, "adding new stat tag");
                let tag = shared(StatTagRecord::new(tag_name));
                live.tag_cache.insert(tag_name.to_string(), tag.clone());
                self.queue.track_new(QueuedRecord::StatTag(tag.clone()));
                tag
            }
        };

        let (network_id, game) = client.key(fallback);
        let match_state = live.state_for_client(network_id, game)?;
        let values = match_state.tag_values.entry(network_id).or_default();

        if let Some(value) = values.get(tag_name) {
            return Some(value.clone());
        }

        debug!(tag = tag_name, client = %client, "adding new stat tag value");
        let value = shared(StatTagValueRecord::new(network_id, tag));
        values.insert(tag_name.to_string(), value.clone());
        self.queue.track_new(QueuedRecord::TagValue(value.clone()));
        Some(value)
    }

    /// Cached all-time maximum for a metric, if one has been recorded.
    pub fn client_numerical_record(
        &self,
        live: &LiveState,
        key: &str,
    ) -> Option<Shared<NumericalRecord>> {
        live.records_cache
            .get(key)?
            .iter()
            .find(|record| record.lock().record_type == RECORD_TYPE_MAXIMUM)
            .cloned()
    }

    pub fn create_client_numerical_record(
        &self,
        live: &mut LiveState,
        network_id: i64,
        round: Shared<RoundStatRecord>,
        key: &str,
        value: f64,
    ) -> Shared<NumericalRecord> {
        let record = shared(NumericalRecord::new_maximum(key, value, network_id, round));
        live.records_cache
            .entry(key.to_string())
            .or_default()
            .push(record.clone());
        self.queue.track_new(QueuedRecord::Numerical(record.clone()));
        record
    }

    /// Append one event-log row, resolving the match from the source client
    /// when possible and falling back to the server's active match.
    #[allow(clippy::too_many_arguments)]
    pub fn track_event_for_log(
        &self,
        live: &mut LiveState,
        server_id: i64,
        event_type: EventLogType,
        source: Option<&ClientIdentity>,
        associated: Option<&ClientIdentity>,
        numerical_value: Option<f64>,
        textual_value: Option<String>,
    ) {
        let game = live.server_game(server_id);

        let mut match_record = None;
        if let (Some(client), Some(game)) = (source, game) {
            let (network_id, game) = client.key(game);
            match_record = live
                .state_for_client(network_id, game)
                .map(|m| m.record.clone());
        }
        let match_record =
            match_record.or_else(|| live.matches.get(&server_id).map(|m| m.record.clone()));

        let log = shared(EventLogRecord {
            meta: RecordMeta::new(),
            event_type,
            source_network_id: source.map(|c| c.network_id),
            associated_network_id: associated.map(|c| c.network_id),
            numerical_value,
            textual_value,
            match_ref: match_record,
            match_id: None,
        });
        self.track_new_state(QueuedRecord::EventLog(log));
    }

    pub fn track_new_state(&self, record: QueuedRecord) {
        self.queue.track_new(record);
    }

    pub fn track_updated_state(&self, record: QueuedRecord) {
        self.queue.track_updated(record);
    }

    /// Drain the persistence queue to the gateway. Creation-ordered inserts
    /// first, then updates; one entity per save. A failed entity is dropped
    /// and the rest are still attempted; a shutdown signal observed between
    /// saves leaves the remainder queued for the next cycle.
    pub async fn update_state(&self, shutdown: &watch::Receiver<bool>) {
        if self.queue.is_empty() {
            return;
        }
        debug!(pending = self.queue.pending_new(), "updating persistent state");

        if *shutdown.borrow() {
            return;
        }

        let _working = self.live.lock().await;

        for entity in self.queue.snapshot_new() {
            if *shutdown.borrow() {
                return;
            }

            let table = entity.table();
            match self.gateway.insert(table, entity.body()).await {
                Ok(id) => entity.set_db_id(id),
                Err(GatewayError::Conflict) => {
                    debug!(table, "entity already tracked, skipping insert");
                }
                Err(err) => error!(table, error = %err, "could not persist new entity"),
            }
            self.queue.remove_new(entity.local_id());
        }
        self.queue.prune_persisted_new();

        for entity in self.queue.snapshot_updated() {
            if *shutdown.borrow() {
                return;
            }

            let table = entity.table();
            let Some(id) = entity.db_id() else {
                debug!(table, "skipping update for entity never persisted");
                self.queue.remove_updated(entity.local_id());
                continue;
            };

            entity.touch_updated();
            if let Err(err) = self.gateway.update(table, id, entity.body()).await {
                error!(table, error = %err, "could not persist entity update");
            }
            self.queue.remove_updated(entity.local_id());
        }
    }

    /// (active matches, tracked clients), for the health surface.
    pub async fn snapshot_counts(&self) -> (usize, usize) {
        let live = self.live.lock().await;
        (live.active_matches(), live.tracked_clients())
    }

    /// Ordered key/value pairs describing one client's lifetime aggregate
    /// under an optional server scope, plus their dynamic stat tags.
    pub async fn client_metrics(
        &self,
        network_id: i64,
        server_id: Option<i64>,
    ) -> Result<Vec<(String, String)>, GatewayError> {
        let stats = self
            .gateway
            .load_aggregates_for_clients(&[network_id], server_id)
            .await?;
        let Some(stat) = stats.first() else {
            return Ok(Vec::new());
        };

        let quit_rate = if stat.total_matches_completed == 0 {
            100
        } else if stat.total_matches_completed - stat.total_matches_played == 0 {
            0
        } else {
            ((1.0 - stat.total_matches_completed as f64 / stat.total_matches_played as f64)
                * 100.0)
                .round() as i64
        };

        let mut metrics: Vec<(String, String)> = vec![
            ("Headshot Kills", stat.totals.headshot_kills.to_string()),
            ("Damage Dealt", stat.totals.damage_dealt.to_string()),
            ("Damage Received", stat.totals.damage_received.to_string()),
            ("Downs", stat.totals.downs.to_string()),
            ("Revives", stat.totals.revives.to_string()),
            ("Points Earned", stat.totals.points_earned.to_string()),
            ("Points Spent", stat.totals.points_spent.to_string()),
            ("Perks Consumed", stat.totals.perks_consumed.to_string()),
            ("Powerups Grabbed", stat.totals.powerups_grabbed.to_string()),
            ("Highest Round", stat.highest_round.to_string()),
            ("Rounds Played", stat.total_rounds_played.to_string()),
            ("Matches Played", stat.total_matches_played.to_string()),
            ("Matches Completed", stat.total_matches_completed.to_string()),
            ("Quit Rate", format!("{quit_rate}%")),
            (
                "Headshot Percentage",
                format!("{}%", (stat.headshot_percentage * 100.0).round()),
            ),
            (
                "Avg. Round Reached",
                format!("{:.1}", stat.average_round_reached),
            ),
            ("Avg. Points", format!("{}", stat.average_points.round())),
            ("Avg. Downs", format!("{:.2}", stat.average_downs)),
            ("Avg. Revives", format!("{:.2}", stat.average_revives)),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();

        for (tag_name, value) in self.gateway.load_tag_values_for_client(network_id).await? {
            let rendered = value
                .stat_value
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string());
            metrics.push((tag_name, rendered));
        }

        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGateway;
    use records::{TABLE_MATCHES, TABLE_ROUND_STATS};
    use std::sync::Arc;

    fn ident(network_id: i64, name: &str) -> ClientIdentity {
        ClientIdentity {
            network_id,
            slot: 0,
            team: "allies".to_string(),
            name: name.to_string(),
            game: None,
        }
    }

    async fn manager() -> ClientStateManager<MemoryGateway> {
        let manager = ClientStateManager::new(MemoryGateway::new());
        manager
            .register_server(1, Game::T6, Some("zm_transit".to_string()))
            .await;
        manager
    }

    #[tokio::test]
    async fn track_client_creates_match_and_round_state() {
        let manager = manager().await;
        manager.track_client(&ident(1001, "alice"), 1).await.unwrap();

        let mut live = manager.live().await;
        let state = live.match_for_server(1).expect("match created on demand");
        assert_eq!(state.round_number, 1);
        assert!(state.round_states.contains_key(&1001));
        assert!(state.match_stats.contains_key(&1001));
        assert_eq!(state.lifetime_stats[&1001].lock().total_matches_played, 1);
    }

    #[tokio::test]
    async fn carry_over_preserves_lifetime_state_between_matches() {
        let manager = manager().await;
        let client = ident(1001, "alice");
        manager.track_client(&client, 1).await.unwrap();

        let lifetime = {
            let mut live = manager.live().await;
            live.match_for_server(1).unwrap().lifetime_stats[&1001].clone()
        };

        manager.end_match(1).await;
        manager.create_match(1).await;

        let mut live = manager.live().await;
        let state = live.match_for_server(1).expect("new match");
        assert!(Arc::ptr_eq(&state.lifetime_stats[&1001], &lifetime));
        assert_eq!(lifetime.lock().total_matches_played, 2);
        // match-scoped stats start fresh
        assert_eq!(state.match_stats[&1001].lock().totals.kills, 0);
    }

    #[tokio::test]
    async fn create_match_is_idempotent_while_one_is_active() {
        let manager = manager().await;
        manager.create_match(1).await;

        let record = {
            let mut live = manager.live().await;
            live.match_for_server(1).unwrap().record.clone()
        };

        manager.create_match(1).await;

        let mut live = manager.live().await;
        assert_eq!(live.active_matches(), 1);
        assert!(Arc::ptr_eq(&live.match_for_server(1).unwrap().record, &record));
    }

    #[tokio::test]
    async fn stale_round_number_is_ignored() {
        let manager = manager().await;
        manager.track_client(&ident(1001, "alice"), 1).await.unwrap();

        {
            let mut live = manager.live().await;
            let before = live.match_for_server(1).unwrap().round_states[&1001]
                .record
                .clone();

            manager.start_next_round(&mut live, 1, 1);
            let state = live.match_for_server(1).unwrap();
            assert!(Arc::ptr_eq(&state.round_states[&1001].record, &before));

            manager.start_next_round(&mut live, 1, 3);
            let state = live.match_for_server(1).unwrap();
            assert_eq!(state.round_number, 3);
            assert_eq!(state.round_states[&1001].record.lock().round_number, 3);
        }
    }

    #[tokio::test]
    async fn flush_assigns_ids_and_drains_queue() {
        let manager = manager().await;
        manager.track_client(&ident(1001, "alice"), 1).await.unwrap();

        let (_tx, shutdown) = watch::channel(false);
        manager.update_state(&shutdown).await;

        assert!(manager.queue.is_empty());
        assert_eq!(manager.gateway().row_count(TABLE_MATCHES), 1);
        assert_eq!(manager.gateway().row_count(TABLE_ROUND_STATS), 1);

        let mut live = manager.live().await;
        let state = live.match_for_server(1).unwrap();
        assert!(state.record.lock().meta.id.is_some());
        // child rows flushed after the parent pick up its id
        let round_body = manager
            .gateway()
            .rows(TABLE_ROUND_STATS)
            .pop()
            .unwrap();
        assert!(round_body.get("match_id").unwrap().as_i64().is_some());
    }

    #[tokio::test]
    async fn conflicting_insert_is_dropped_without_blocking_others() {
        let manager = manager().await;
        manager.gateway().set_conflict(TABLE_MATCHES);
        manager.track_client(&ident(1001, "alice"), 1).await.unwrap();

        let (_tx, shutdown) = watch::channel(false);
        manager.update_state(&shutdown).await;

        assert!(manager.queue.is_empty());
        assert_eq!(manager.gateway().row_count(TABLE_MATCHES), 0);
        assert_eq!(manager.gateway().row_count(TABLE_ROUND_STATS), 1);
    }

    #[tokio::test]
    async fn failed_insert_is_dropped_and_remainder_still_flushed() {
        let manager = manager().await;
        manager.gateway().set_failing(TABLE_ROUND_STATS);
        manager.track_client(&ident(1001, "alice"), 1).await.unwrap();

        let (_tx, shutdown) = watch::channel(false);
        manager.update_state(&shutdown).await;

        // the failed entity is gone, everything queued after it still lands
        assert!(manager.queue.is_empty());
        assert_eq!(manager.gateway().row_count(TABLE_ROUND_STATS), 0);
        assert_eq!(manager.gateway().row_count(TABLE_MATCHES), 1);

        // no retry on the next cycle; the row only reappears if re-queued
        manager.update_state(&shutdown).await;
        assert_eq!(manager.gateway().row_count(TABLE_ROUND_STATS), 0);
    }

    #[tokio::test]
    async fn round_advance_reseeds_round_states_for_rostered_clients() {
        let manager = manager().await;
        manager.track_client(&ident(1001, "alice"), 1).await.unwrap();

        let mut live = manager.live().await;
        let first = live.match_for_server(1).unwrap().round_states[&1001]
            .record
            .clone();
        manager.start_next_round(&mut live, 1, 2);

        let state = live.match_for_server(1).unwrap();
        assert_eq!(state.round_number, 2);
        let reseeded = &state.round_states[&1001];
        assert_eq!(reseeded.record.lock().round_number, 2);
        assert!(!Arc::ptr_eq(&first, &reseeded.record));
    }

    #[tokio::test]
    async fn shutdown_signal_leaves_queue_intact() {
        let manager = manager().await;
        manager.track_client(&ident(1001, "alice"), 1).await.unwrap();

        let (_tx, shutdown) = watch::channel(true);
        manager.update_state(&shutdown).await;

        assert!(!manager.queue.is_empty());
        assert_eq!(manager.gateway().row_count(TABLE_MATCHES), 0);
    }

    #[tokio::test]
    async fn stat_tag_value_is_created_once_per_client() {
        let manager = manager().await;
        let client = ident(1001, "alice");
        manager.track_client(&client, 1).await.unwrap();

        let mut live = manager.live().await;
        let first = manager
            .stat_tag_value_for_client(&mut live, &client, Game::T6, "Prestige")
            .expect("client has match context");
        let second = manager
            .stat_tag_value_for_client(&mut live, &client, Game::T6, "Prestige")
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(live.tag_cache.contains_key("Prestige"));
    }

    #[tokio::test]
    async fn tag_value_without_match_context_is_refused() {
        let manager = manager().await;
        let mut live = manager.live().await;
        let value =
            manager.stat_tag_value_for_client(&mut live, &ident(9, "ghost"), Game::T6, "Prestige");
        assert!(value.is_none());
    }
}
