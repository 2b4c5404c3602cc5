//! Live per-match state

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::events::Game;

use super::records::{
    AggregateStatRecord, MatchClientStatRecord, MatchRecord, RoundStatRecord, Shared,
    StatTagValueRecord,
};

/// Transient per-client round state. Created when a client is added to a
/// match or a new round starts; superseded state is simply dropped.
#[derive(Debug, Clone)]
pub struct RoundState {
    pub record: Shared<RoundStatRecord>,
    /// Set when the client died this round; trims time-alive at round end.
    pub died_at: Option<DateTime<Utc>>,
    /// Successful hits this round, denominator for headshot percentage.
    pub hits: i64,
}

impl RoundState {
    pub fn new(record: Shared<RoundStatRecord>) -> Self {
        Self {
            record,
            died_at: None,
            hits: 0,
        }
    }
}

/// All live state for one active match. At most one per server; the state
/// manager's structural lock guards every map in here.
pub struct MatchState {
    pub server_id: i64,
    pub game: Game,
    pub round_number: i32,
    pub record: Shared<MatchRecord>,
    /// Keyed by client network id.
    pub round_states: HashMap<i64, RoundState>,
    pub match_stats: HashMap<i64, Shared<MatchClientStatRecord>>,
    pub lifetime_stats: HashMap<i64, Shared<AggregateStatRecord>>,
    pub lifetime_server_stats: HashMap<i64, Shared<AggregateStatRecord>>,
    pub tag_values: HashMap<i64, HashMap<String, Shared<StatTagValueRecord>>>,
}

impl MatchState {
    pub fn new(server_id: i64, game: Game, record: Shared<MatchRecord>) -> Self {
        Self {
            server_id,
            game,
            round_number: 0,
            record,
            round_states: HashMap::new(),
            match_stats: HashMap::new(),
            lifetime_stats: HashMap::new(),
            lifetime_server_stats: HashMap::new(),
            tag_values: HashMap::new(),
        }
    }

    pub fn remove_client(&mut self, network_id: i64) {
        self.round_states.remove(&network_id);
        self.match_stats.remove(&network_id);
        self.lifetime_stats.remove(&network_id);
        self.lifetime_server_stats.remove(&network_id);
        self.tag_values.remove(&network_id);
    }
}
