//! In-memory gateway backed by plain maps
//!
//! Backs the unit tests and offline runs; rows are stored as the same JSON
//! bodies the REST gateway would send.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::state::records::{
    AggregateStatRecord, MatchClientStatRecord, NumericalRecord, RoundStatRecord, StatTagRecord,
    StatTagValueRecord, TABLE_AGGREGATES, TABLE_MATCH_STATS, TABLE_RECORDS, TABLE_ROUND_STATS,
    TABLE_STAT_TAGS, TABLE_TAG_VALUES,
};

use super::{GatewayError, StatsGateway};

#[derive(Default)]
pub struct MemoryGateway {
    tables: Mutex<HashMap<&'static str, Vec<(i64, Value)>>>,
    next_id: AtomicI64,
    conflict_tables: Mutex<HashSet<&'static str>>,
    failing_tables: Mutex<HashSet<&'static str>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    /// Number of rows currently stored for a table.
    pub fn row_count(&self, table: &'static str) -> usize {
        self.tables
            .lock()
            .get(table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    pub fn rows(&self, table: &'static str) -> Vec<Value> {
        self.tables
            .lock()
            .get(table)
            .map(|rows| rows.iter().map(|(_, body)| body.clone()).collect())
            .unwrap_or_default()
    }

    /// Make inserts into `table` report the benign already-tracked conflict.
    pub fn set_conflict(&self, table: &'static str) {
        self.conflict_tables.lock().insert(table);
    }

    /// Make writes to `table` fail with a non-conflict error.
    pub fn set_failing(&self, table: &'static str) {
        self.failing_tables.lock().insert(table);
    }

    fn check_write(&self, table: &'static str) -> Result<(), GatewayError> {
        if self.conflict_tables.lock().contains(table) {
            return Err(GatewayError::Conflict);
        }
        if self.failing_tables.lock().contains(table) {
            return Err(GatewayError::Api {
                status: 500,
                body: "synthetic failure".to_string(),
            });
        }
        Ok(())
    }

    fn load_typed<T: DeserializeOwned>(
        &self,
        table: &'static str,
        filter: impl Fn(&Value) -> bool,
    ) -> Vec<T> {
        let tables = self.tables.lock();
        let Some(rows) = tables.get(table) else {
            return Vec::new();
        };

        rows.iter()
            .filter(|(_, body)| filter(body))
            .filter_map(|(id, body)| {
                let mut body = body.clone();
                if let Some(map) = body.as_object_mut() {
                    map.insert("id".to_string(), Value::from(*id));
                }
                serde_json::from_value(body).ok()
            })
            .collect()
    }
}

fn int_field(body: &Value, field: &str) -> Option<i64> {
    body.get(field).and_then(Value::as_i64)
}

#[async_trait]
impl StatsGateway for MemoryGateway {
    async fn insert(&self, table: &'static str, body: Value) -> Result<i64, GatewayError> {
        self.check_write(table)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tables.lock().entry(table).or_default().push((id, body));
        Ok(id)
    }

    async fn update(&self, table: &'static str, id: i64, body: Value) -> Result<(), GatewayError> {
        self.check_write(table)?;

        let mut tables = self.tables.lock();
        if let Some(rows) = tables.get_mut(table) {
            if let Some(row) = rows.iter_mut().find(|(row_id, _)| *row_id == id) {
                row.1 = body;
            }
        }
        Ok(())
    }

    async fn load_numerical_records(&self) -> Result<Vec<NumericalRecord>, GatewayError> {
        Ok(self.load_typed(TABLE_RECORDS, |_| true))
    }

    async fn load_stat_tags(&self) -> Result<Vec<StatTagRecord>, GatewayError> {
        Ok(self.load_typed(TABLE_STAT_TAGS, |_| true))
    }

    async fn load_aggregates_for_client(
        &self,
        network_id: i64,
    ) -> Result<Vec<AggregateStatRecord>, GatewayError> {
        Ok(self.load_typed(TABLE_AGGREGATES, |body| {
            int_field(body, "network_id") == Some(network_id)
        }))
    }

    async fn load_aggregates_for_clients(
        &self,
        network_ids: &[i64],
        server_id: Option<i64>,
    ) -> Result<Vec<AggregateStatRecord>, GatewayError> {
        Ok(self.load_typed(TABLE_AGGREGATES, |body| {
            let matches_client = int_field(body, "network_id")
                .map(|id| network_ids.contains(&id))
                .unwrap_or(false);
            matches_client && int_field(body, "server_id") == server_id
        }))
    }

    async fn load_match_client_stat(
        &self,
        network_id: i64,
        match_id: i64,
    ) -> Result<Option<MatchClientStatRecord>, GatewayError> {
        Ok(self
            .load_typed(TABLE_MATCH_STATS, |body| {
                int_field(body, "network_id") == Some(network_id)
                    && int_field(body, "match_id") == Some(match_id)
            })
            .into_iter()
            .next())
    }

    async fn load_round_stat(
        &self,
        network_id: i64,
        match_id: i64,
        round_number: i32,
    ) -> Result<Option<RoundStatRecord>, GatewayError> {
        Ok(self
            .load_typed(TABLE_ROUND_STATS, |body| {
                int_field(body, "network_id") == Some(network_id)
                    && int_field(body, "match_id") == Some(match_id)
                    && int_field(body, "round_number") == Some(round_number as i64)
            })
            .into_iter()
            .next())
    }

    async fn load_tag_values_for_client(
        &self,
        network_id: i64,
    ) -> Result<Vec<(String, StatTagValueRecord)>, GatewayError> {
        let values: Vec<StatTagValueRecord> = self.load_typed(TABLE_TAG_VALUES, |body| {
            int_field(body, "network_id") == Some(network_id)
        });

        let tables = self.tables.lock();
        let tag_rows = tables.get(TABLE_STAT_TAGS).cloned().unwrap_or_default();
        drop(tables);

        Ok(values
            .into_iter()
            .filter_map(|value| {
                let tag_id = value.stat_tag_id?;
                let name = tag_rows
                    .iter()
                    .find(|(id, _)| *id == tag_id)
                    .and_then(|(_, body)| body.get("tag_name"))
                    .and_then(Value::as_str)?
                    .to_string();
                Some((name, value))
            })
            .collect())
    }
}
