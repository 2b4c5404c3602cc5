//! Persisted record types
//!
//! Every row shares the dated-record envelope: a database id that stays
//! `None` until the first successful save, a creation timestamp, and an
//! update timestamp stamped at flush time. Records are shared between the
//! live maps and the persistence queue, so they live behind `Shared<T>`; the
//! state manager is the single logical owner for mutation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Shared<T> = Arc<parking_lot::Mutex<T>>;

pub fn shared<T>(value: T) -> Shared<T> {
    Arc::new(parking_lot::Mutex::new(value))
}

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

fn next_local_id() -> u64 {
    NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Envelope shared by all persisted rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Process-local identity used for queue deduplication.
    #[serde(skip, default = "next_local_id")]
    pub local_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RecordMeta {
    pub fn new() -> Self {
        Self {
            local_id: next_local_id(),
            id: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

impl Default for RecordMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter block shared by round rows and both aggregate flavors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatTotals {
    pub kills: i64,
    pub deaths: i64,
    pub damage_dealt: i64,
    pub damage_received: i64,
    pub headshots: i64,
    pub headshot_kills: i64,
    pub melees: i64,
    pub downs: i64,
    pub revives: i64,
    pub points_earned: i64,
    pub points_spent: i64,
    pub perks_consumed: i64,
    pub powerups_grabbed: i64,
}

impl StatTotals {
    /// Fold one completed round into a running total.
    pub fn add(&mut self, round: &StatTotals) {
        self.kills += round.kills;
        self.deaths += round.deaths;
        self.damage_dealt += round.damage_dealt;
        self.damage_received += round.damage_received;
        self.headshots += round.headshots;
        self.headshot_kills += round.headshot_kills;
        self.melees += round.melees;
        self.downs += round.downs;
        self.revives += round.revives;
        self.points_earned += round.points_earned;
        self.points_spent += round.points_spent;
        self.perks_consumed += round.perks_consumed;
        self.powerups_grabbed += round.powerups_grabbed;
    }
}

/// One play-session on a server, from start to end signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub server_id: i64,
    pub map_name: Option<String>,
    pub match_start: DateTime<Utc>,
    pub match_end: Option<DateTime<Utc>>,
    pub clients_completed: i32,
}

impl MatchRecord {
    pub fn new(server_id: i64, map_name: Option<String>) -> Self {
        Self {
            meta: RecordMeta::new(),
            server_id,
            map_name,
            match_start: Utc::now(),
            match_end: None,
            clients_completed: 0,
        }
    }
}

/// Per-client, per-round stat row. Superseded rows are simply never flushed
/// again once the next round starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundStatRecord {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub network_id: i64,
    #[serde(skip)]
    pub match_ref: Option<Shared<MatchRecord>>,
    pub match_id: Option<i64>,
    pub round_number: i32,
    #[serde(flatten)]
    pub totals: StatTotals,
    /// Net score at round end as reported by the game.
    pub points: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub time_alive_ms: Option<i64>,
}

impl RoundStatRecord {
    pub fn new(network_id: i64, match_ref: Shared<MatchRecord>, round_number: i32) -> Self {
        Self {
            meta: RecordMeta::new(),
            network_id,
            match_ref: Some(match_ref),
            match_id: None,
            round_number,
            totals: StatTotals::default(),
            points: 0,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            time_alive_ms: None,
        }
    }

    fn resolve_refs(&mut self) {
        if let Some(parent) = &self.match_ref {
            self.match_id = parent.lock().meta.id;
        }
    }
}

/// Match-scoped aggregate for one client, reset at match start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchClientStatRecord {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub network_id: i64,
    #[serde(skip)]
    pub match_ref: Option<Shared<MatchRecord>>,
    pub match_id: Option<i64>,
    /// Round the client first joined this match; denominator for the
    /// highest-round credit rule.
    pub joined_round: Option<i32>,
    #[serde(flatten)]
    pub totals: StatTotals,
}

impl MatchClientStatRecord {
    pub fn new(network_id: i64, match_ref: Shared<MatchRecord>) -> Self {
        Self {
            meta: RecordMeta::new(),
            network_id,
            match_ref: Some(match_ref),
            match_id: None,
            joined_round: None,
            totals: StatTotals::default(),
        }
    }

    fn resolve_refs(&mut self) {
        if let Some(parent) = &self.match_ref {
            self.match_id = parent.lock().meta.id;
        }
    }
}

/// Lifetime aggregate for one client: global when `server_id` is `None`,
/// per-server otherwise. Mutated once per round-completion event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateStatRecord {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub network_id: i64,
    pub server_id: Option<i64>,
    #[serde(flatten)]
    pub totals: StatTotals,
    pub highest_round: i64,
    pub total_rounds_played: i64,
    pub total_matches_played: i64,
    pub total_matches_completed: i64,
    pub average_kills_per_down: f64,
    pub average_downs: f64,
    pub average_revives: f64,
    pub headshot_percentage: f64,
    pub alive_percentage: f64,
    pub average_melees: f64,
    pub average_round_reached: f64,
    pub average_points: f64,
}

impl AggregateStatRecord {
    pub fn new(network_id: i64, server_id: Option<i64>) -> Self {
        Self {
            meta: RecordMeta::new(),
            network_id,
            server_id,
            totals: StatTotals::default(),
            highest_round: 0,
            total_rounds_played: 0,
            total_matches_played: 0,
            total_matches_completed: 0,
            average_kills_per_down: 0.0,
            average_downs: 0.0,
            average_revives: 0.0,
            headshot_percentage: 0.0,
            alive_percentage: 0.0,
            average_melees: 0.0,
            average_round_reached: 0.0,
            average_points: 0.0,
        }
    }

    /// Numeric value of a named aggregate field. Replaces the original's
    /// reflection-driven property lookup with an explicit table.
    pub fn metric(&self, key: &str) -> Option<f64> {
        let value = match key {
            "kills" => self.totals.kills as f64,
            "deaths" => self.totals.deaths as f64,
            "damage_dealt" => self.totals.damage_dealt as f64,
            "damage_received" => self.totals.damage_received as f64,
            "headshots" => self.totals.headshots as f64,
            "headshot_kills" => self.totals.headshot_kills as f64,
            "melees" => self.totals.melees as f64,
            "downs" => self.totals.downs as f64,
            "revives" => self.totals.revives as f64,
            "points_earned" => self.totals.points_earned as f64,
            "points_spent" => self.totals.points_spent as f64,
            "perks_consumed" => self.totals.perks_consumed as f64,
            "powerups_grabbed" => self.totals.powerups_grabbed as f64,
            "highest_round" => self.highest_round as f64,
            "total_rounds_played" => self.total_rounds_played as f64,
            "average_kills_per_down" => self.average_kills_per_down,
            "average_downs" => self.average_downs,
            "average_revives" => self.average_revives,
            "headshot_percentage" => self.headshot_percentage,
            "alive_percentage" => self.alive_percentage,
            "average_melees" => self.average_melees,
            "average_round_reached" => self.average_round_reached,
            "average_points" => self.average_points,
            _ => return None,
        };
        Some(value)
    }
}

/// Aggregate fields tracked against the all-time maximum record store.
pub const RECORD_KEYS: &[&str] = &[
    "kills",
    "deaths",
    "damage_dealt",
    "damage_received",
    "headshots",
    "headshot_kills",
    "melees",
    "downs",
    "revives",
    "points_earned",
    "points_spent",
    "perks_consumed",
    "powerups_grabbed",
    "highest_round",
    "total_rounds_played",
    "average_kills_per_down",
    "average_downs",
    "average_revives",
    "headshot_percentage",
    "alive_percentage",
    "average_round_reached",
    "average_points",
];

/// Subset of [`RECORD_KEYS`] that feeds the normalized skill score.
pub const SKILL_KEYS: &[&str] = &[
    "average_kills_per_down",
    "average_round_reached",
    "average_points",
    "headshot_percentage",
    "alive_percentage",
    "average_revives",
];

/// Definition row for a dynamically-named stat tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatTagRecord {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub tag_name: String,
}

impl StatTagRecord {
    pub fn new(tag_name: impl Into<String>) -> Self {
        Self {
            meta: RecordMeta::new(),
            tag_name: tag_name.into(),
        }
    }
}

/// Sparse integer counter value for one (client, tag) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatTagValueRecord {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub network_id: i64,
    #[serde(skip)]
    pub tag_ref: Option<Shared<StatTagRecord>>,
    pub stat_tag_id: Option<i64>,
    pub stat_value: Option<i64>,
}

impl StatTagValueRecord {
    pub fn new(network_id: i64, tag_ref: Shared<StatTagRecord>) -> Self {
        Self {
            meta: RecordMeta::new(),
            network_id,
            tag_ref: Some(tag_ref),
            stat_tag_id: None,
            stat_value: None,
        }
    }

    fn resolve_refs(&mut self) {
        if let Some(tag) = &self.tag_ref {
            self.stat_tag_id = tag.lock().meta.id;
        }
    }
}

/// Maximum observed value for a named metric across all clients and rounds.
/// Normalization denominator for the skill score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumericalRecord {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub name: String,
    pub record_type: String,
    pub value: f64,
    pub network_id: Option<i64>,
    #[serde(skip)]
    pub round_ref: Option<Shared<RoundStatRecord>>,
    pub round_id: Option<i64>,
}

pub const RECORD_TYPE_MAXIMUM: &str = "Maximum";

impl NumericalRecord {
    pub fn new_maximum(
        name: impl Into<String>,
        value: f64,
        network_id: i64,
        round_ref: Shared<RoundStatRecord>,
    ) -> Self {
        Self {
            meta: RecordMeta::new(),
            name: name.into(),
            record_type: RECORD_TYPE_MAXIMUM.to_string(),
            value,
            network_id: Some(network_id),
            round_ref: Some(round_ref),
            round_id: None,
        }
    }

    fn resolve_refs(&mut self) {
        if let Some(round) = &self.round_ref {
            self.round_id = round.lock().meta.id;
        }
    }
}

/// Kind tag for event-log rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventLogType {
    MatchStarted,
    MatchEnded,
    JoinedMatch,
    LeftMatch,
    Died,
    DamageTaken,
    Downed,
    Revived,
    PerkConsumed,
    PowerupGrabbed,
    RoundCompleted,
}

/// Append-only log line for notable in-match events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogRecord {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub event_type: EventLogType,
    pub source_network_id: Option<i64>,
    pub associated_network_id: Option<i64>,
    pub numerical_value: Option<f64>,
    pub textual_value: Option<String>,
    #[serde(skip)]
    pub match_ref: Option<Shared<MatchRecord>>,
    pub match_id: Option<i64>,
}

impl EventLogRecord {
    fn resolve_refs(&mut self) {
        if let Some(parent) = &self.match_ref {
            self.match_id = parent.lock().meta.id;
        }
    }
}

pub const TABLE_MATCHES: &str = "horde_matches";
pub const TABLE_ROUND_STATS: &str = "horde_round_client_stats";
pub const TABLE_MATCH_STATS: &str = "horde_match_client_stats";
pub const TABLE_AGGREGATES: &str = "horde_client_stat_aggregates";
pub const TABLE_RECORDS: &str = "horde_client_stat_records";
pub const TABLE_STAT_TAGS: &str = "horde_client_stat_tags";
pub const TABLE_TAG_VALUES: &str = "horde_client_stat_tag_values";
pub const TABLE_EVENT_LOGS: &str = "horde_event_logs";

/// A record handle queued for persistence.
#[derive(Debug, Clone)]
pub enum QueuedRecord {
    Match(Shared<MatchRecord>),
    Round(Shared<RoundStatRecord>),
    MatchClientStat(Shared<MatchClientStatRecord>),
    Aggregate(Shared<AggregateStatRecord>),
    StatTag(Shared<StatTagRecord>),
    TagValue(Shared<StatTagValueRecord>),
    Numerical(Shared<NumericalRecord>),
    EventLog(Shared<EventLogRecord>),
}

impl QueuedRecord {
    fn with_meta<R>(&self, f: impl FnOnce(&RecordMeta) -> R) -> R {
        match self {
            QueuedRecord::Match(rec) => f(&rec.lock().meta),
            QueuedRecord::Round(rec) => f(&rec.lock().meta),
            QueuedRecord::MatchClientStat(rec) => f(&rec.lock().meta),
            QueuedRecord::Aggregate(rec) => f(&rec.lock().meta),
            QueuedRecord::StatTag(rec) => f(&rec.lock().meta),
            QueuedRecord::TagValue(rec) => f(&rec.lock().meta),
            QueuedRecord::Numerical(rec) => f(&rec.lock().meta),
            QueuedRecord::EventLog(rec) => f(&rec.lock().meta),
        }
    }

    fn with_meta_mut(&self, f: impl FnOnce(&mut RecordMeta)) {
        match self {
            QueuedRecord::Match(rec) => f(&mut rec.lock().meta),
            QueuedRecord::Round(rec) => f(&mut rec.lock().meta),
            QueuedRecord::MatchClientStat(rec) => f(&mut rec.lock().meta),
            QueuedRecord::Aggregate(rec) => f(&mut rec.lock().meta),
            QueuedRecord::StatTag(rec) => f(&mut rec.lock().meta),
            QueuedRecord::TagValue(rec) => f(&mut rec.lock().meta),
            QueuedRecord::Numerical(rec) => f(&mut rec.lock().meta),
            QueuedRecord::EventLog(rec) => f(&mut rec.lock().meta),
        }
    }

    pub fn local_id(&self) -> u64 {
        self.with_meta(|meta| meta.local_id)
    }

    pub fn db_id(&self) -> Option<i64> {
        self.with_meta(|meta| meta.id)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.with_meta(|meta| meta.created_at)
    }

    pub fn set_db_id(&self, id: i64) {
        self.with_meta_mut(|meta| meta.id = Some(id));
    }

    pub fn touch_updated(&self) {
        self.with_meta_mut(|meta| meta.updated_at = Some(Utc::now()));
    }

    pub fn table(&self) -> &'static str {
        match self {
            QueuedRecord::Match(_) => TABLE_MATCHES,
            QueuedRecord::Round(_) => TABLE_ROUND_STATS,
            QueuedRecord::MatchClientStat(_) => TABLE_MATCH_STATS,
            QueuedRecord::Aggregate(_) => TABLE_AGGREGATES,
            QueuedRecord::StatTag(_) => TABLE_STAT_TAGS,
            QueuedRecord::TagValue(_) => TABLE_TAG_VALUES,
            QueuedRecord::Numerical(_) => TABLE_RECORDS,
            QueuedRecord::EventLog(_) => TABLE_EVENT_LOGS,
        }
    }

    /// Serialize the record body for the gateway, resolving parent-row ids
    /// at flush time so rows persisted earlier in the same drain are linked.
    pub fn body(&self) -> serde_json::Value {
        match self {
            QueuedRecord::Match(rec) => serde_json::to_value(&*rec.lock()),
            QueuedRecord::Round(rec) => {
                let mut record = rec.lock();
                record.resolve_refs();
                serde_json::to_value(&*record)
            }
            QueuedRecord::MatchClientStat(rec) => {
                let mut record = rec.lock();
                record.resolve_refs();
                serde_json::to_value(&*record)
            }
            QueuedRecord::Aggregate(rec) => serde_json::to_value(&*rec.lock()),
            QueuedRecord::StatTag(rec) => serde_json::to_value(&*rec.lock()),
            QueuedRecord::TagValue(rec) => {
                let mut record = rec.lock();
                record.resolve_refs();
                serde_json::to_value(&*record)
            }
            QueuedRecord::Numerical(rec) => {
                let mut record = rec.lock();
                record.resolve_refs();
                serde_json::to_value(&*record)
            }
            QueuedRecord::EventLog(rec) => {
                let mut record = rec.lock();
                record.resolve_refs();
                serde_json::to_value(&*record)
            }
        }
        .unwrap_or(serde_json::Value::Null)
    }
}
