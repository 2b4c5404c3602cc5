//! Durable object store for stat records

pub mod memory;
pub mod supabase;

pub use memory::MemoryGateway;
pub use supabase::SupabaseGateway;

use async_trait::async_trait;
use serde_json::Value;

use crate::state::records::{
    AggregateStatRecord, MatchClientStatRecord, NumericalRecord, RoundStatRecord, StatTagRecord,
    StatTagValueRecord,
};

/// Gateway errors. `Conflict` is the benign "entity already tracked"
/// condition; anything else is logged by the caller and the entity dropped
/// from the queue.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("entity already tracked")]
    Conflict,

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse response: {0}")]
    Parse(reqwest::Error),

    #[error("No row returned from insert")]
    NoRowReturned,
}

/// Abstract durable store consumed by the state manager. Rows are created
/// and updated one at a time, once per dirty entity per flush cycle.
#[async_trait]
pub trait StatsGateway: Send + Sync {
    /// Insert a row, returning its new database id.
    async fn insert(&self, table: &'static str, body: Value) -> Result<i64, GatewayError>;

    /// Update an existing row by id.
    async fn update(&self, table: &'static str, id: i64, body: Value) -> Result<(), GatewayError>;

    /// All maximum-value records; loaded once at startup into the record cache.
    async fn load_numerical_records(&self) -> Result<Vec<NumericalRecord>, GatewayError>;

    /// All stat-tag definitions; loaded once at startup into the tag cache.
    async fn load_stat_tags(&self) -> Result<Vec<StatTagRecord>, GatewayError>;

    /// Lifetime aggregates (global and per-server) for one client.
    async fn load_aggregates_for_client(
        &self,
        network_id: i64,
    ) -> Result<Vec<AggregateStatRecord>, GatewayError>;

    /// Aggregates for a set of clients under an optional server scope, for
    /// the reporting surface.
    async fn load_aggregates_for_clients(
        &self,
        network_ids: &[i64],
        server_id: Option<i64>,
    ) -> Result<Vec<AggregateStatRecord>, GatewayError>;

    /// Match-scoped stat row for a client reconnecting mid-match.
    async fn load_match_client_stat(
        &self,
        network_id: i64,
        match_id: i64,
    ) -> Result<Option<MatchClientStatRecord>, GatewayError>;

    /// Round row for a client reconnecting mid-round.
    async fn load_round_stat(
        &self,
        network_id: i64,
        match_id: i64,
        round_number: i32,
    ) -> Result<Option<RoundStatRecord>, GatewayError>;

    /// Stat-tag values for one client, paired with their tag names.
    async fn load_tag_values_for_client(
        &self,
        network_id: i64,
    ) -> Result<Vec<(String, StatTagValueRecord)>, GatewayError>;
}
