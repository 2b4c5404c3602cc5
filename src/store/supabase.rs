//! Supabase REST gateway using service_role key

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::config::Config;
use crate::state::records::{
    AggregateStatRecord, MatchClientStatRecord, NumericalRecord, RoundStatRecord, StatTagRecord,
    StatTagValueRecord, TABLE_AGGREGATES, TABLE_MATCH_STATS, TABLE_RECORDS, TABLE_ROUND_STATS,
    TABLE_STAT_TAGS, TABLE_TAG_VALUES,
};

use super::{GatewayError, StatsGateway};

/// PostgREST-backed durable store. Uses the service_role key which bypasses
/// RLS - handle with care!
#[derive(Clone)]
pub struct SupabaseGateway {
    client: Client,
    base_url: String,
    service_role_key: String,
}

impl SupabaseGateway {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.clone(),
            service_role_key: config.supabase_service_role_key.clone(),
        }
    }

    /// Get the REST API URL for a table
    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// Make an authenticated GET request
    async fn get<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &str,
    ) -> Result<Vec<T>, GatewayError> {
        let url = format!("{}?{}", self.rest_url(table), query);

        let response = self
            .client
            .get(&url)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(GatewayError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        response.json().await.map_err(GatewayError::Parse)
    }
}

#[derive(Deserialize)]
struct InsertedRow {
    id: i64,
}

#[derive(Deserialize)]
struct TagNameRow {
    tag_name: String,
}

#[derive(Deserialize)]
struct TagValueRow {
    #[serde(flatten)]
    value: StatTagValueRecord,
    #[serde(rename = "horde_client_stat_tags")]
    tag: Option<TagNameRow>,
}

#[async_trait]
impl StatsGateway for SupabaseGateway {
    async fn insert(&self, table: &'static str, body: Value) -> Result<i64, GatewayError> {
        let url = self.rest_url(table);

        let response = self
            .client
            .post(&url)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await
            .map_err(GatewayError::Request)?;

        // 409 means a unique constraint already holds the row
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(GatewayError::Conflict);
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        // PostgREST returns an array, get first element
        let rows: Vec<InsertedRow> = response.json().await.map_err(GatewayError::Parse)?;
        rows.into_iter()
            .next()
            .map(|row| row.id)
            .ok_or(GatewayError::NoRowReturned)
    }

    async fn update(&self, table: &'static str, id: i64, body: Value) -> Result<(), GatewayError> {
        let url = format!("{}?id=eq.{}", self.rest_url(table), id);

        let response = self
            .client
            .patch(&url)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(GatewayError::Request)?;

        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(GatewayError::Conflict);
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }

    async fn load_numerical_records(&self) -> Result<Vec<NumericalRecord>, GatewayError> {
        self.get(TABLE_RECORDS, "select=*").await
    }

    async fn load_stat_tags(&self) -> Result<Vec<StatTagRecord>, GatewayError> {
        self.get(TABLE_STAT_TAGS, "select=*").await
    }

    async fn load_aggregates_for_client(
        &self,
        network_id: i64,
    ) -> Result<Vec<AggregateStatRecord>, GatewayError> {
        let query = format!("network_id=eq.{network_id}&select=*");
        self.get(TABLE_AGGREGATES, &query).await
    }

    async fn load_aggregates_for_clients(
        &self,
        network_ids: &[i64],
        server_id: Option<i64>,
    ) -> Result<Vec<AggregateStatRecord>, GatewayError> {
        let ids = network_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let scope = match server_id {
            Some(id) => format!("server_id=eq.{id}"),
            None => "server_id=is.null".to_string(),
        };
        let query = format!("network_id=in.({ids})&{scope}&select=*");
        self.get(TABLE_AGGREGATES, &query).await
    }

    async fn load_match_client_stat(
        &self,
        network_id: i64,
        match_id: i64,
    ) -> Result<Option<MatchClientStatRecord>, GatewayError> {
        let query = format!("network_id=eq.{network_id}&match_id=eq.{match_id}&select=*&limit=1");
        let rows: Vec<MatchClientStatRecord> = self.get(TABLE_MATCH_STATS, &query).await?;
        Ok(rows.into_iter().next())
    }

    async fn load_round_stat(
        &self,
        network_id: i64,
        match_id: i64,
        round_number: i32,
    ) -> Result<Option<RoundStatRecord>, GatewayError> {
        let query = format!(
            "network_id=eq.{network_id}&match_id=eq.{match_id}&round_number=eq.{round_number}&select=*&limit=1"
        );
        let rows: Vec<RoundStatRecord> = self.get(TABLE_ROUND_STATS, &query).await?;
        Ok(rows.into_iter().next())
    }

    async fn load_tag_values_for_client(
        &self,
        network_id: i64,
    ) -> Result<Vec<(String, StatTagValueRecord)>, GatewayError> {
        let query = format!("network_id=eq.{network_id}&select=*,horde_client_stat_tags(tag_name)");
        let rows: Vec<TagValueRow> = self.get(TABLE_TAG_VALUES, &query).await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.tag.map(|tag| (tag.tag_name, row.value)))
            .collect())
    }
}
