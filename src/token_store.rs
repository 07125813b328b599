//! Tracking-token persistence.
//!
//! One `token_entry` row per (processor, segment) holds the serialized
//! position of an event processor and the node currently claiming it. Only
//! the claiming node may move the token; a claim lapses after the configured
//! timeout and can then be taken over.

use crate::db::schema::TOKEN_ENTRY;
use crate::db::{Entity, EntityManager, EntityManagerProvider, SqliteQuery, Table};
use crate::error::{ErrorKind, InfraError};
use crate::serialization::{Serializer, deserialize_object, serialize_object};
use crate::tx::UnitOfWork;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Position in the global event sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSequenceTrackingToken {
    pub global_index: i64,
}

impl GlobalSequenceTrackingToken {
    pub fn new(global_index: i64) -> Self {
        Self { global_index }
    }

    pub fn advance_to(self, global_index: i64) -> Self {
        Self {
            global_index: self.global_index.max(global_index),
        }
    }
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct TokenEntry {
    pub processor_name: String,
    pub segment: i32,
    pub token: Option<Vec<u8>>,
    pub token_type: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub owner: Option<String>,
}

impl Entity for TokenEntry {
    type Id = (String, i32);

    const TABLE: &'static Table = &TOKEN_ENTRY;

    fn bind_columns<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.processor_name.clone())
            .bind(self.segment)
            .bind(self.token.clone())
            .bind(self.token_type.clone())
            .bind(self.timestamp)
            .bind(self.owner.clone())
    }

    fn bind_id<'q>(id: &Self::Id, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query.bind(id.0.clone()).bind(id.1)
    }
}

impl TokenEntry {
    fn is_claimable_by(&self, node_id: &str, expired_before: DateTime<Utc>) -> bool {
        match self.owner.as_deref() {
            None => true,
            Some(owner) if owner == node_id => true,
            Some(_) => self.timestamp < expired_before,
        }
    }
}

pub struct TokenStore {
    entity_manager_provider: Arc<EntityManagerProvider>,
    serializer: Arc<dyn Serializer>,
    node_id: String,
    claim_timeout: Duration,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("node_id", &self.node_id)
            .field("claim_timeout", &self.claim_timeout)
            .field("serializer", &self.serializer)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct TokenStoreBuilder {
    entity_manager_provider: Option<Arc<EntityManagerProvider>>,
    serializer: Option<Arc<dyn Serializer>>,
    node_id: Option<String>,
    claim_timeout: Option<Duration>,
}

impl TokenStoreBuilder {
    pub fn entity_manager_provider(mut self, provider: Arc<EntityManagerProvider>) -> Self {
        self.entity_manager_provider = Some(provider);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = Some(claim_timeout);
        self
    }

    pub fn build(self) -> Result<TokenStore, InfraError> {
        let entity_manager_provider = self
            .entity_manager_provider
            .ok_or(InfraError::MissingComponent("token store entity manager provider"))?;
        let serializer = self
            .serializer
            .ok_or(InfraError::MissingComponent("token store serializer"))?;
        let node_id = self
            .node_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(default_node_id);
        Ok(TokenStore {
            entity_manager_provider,
            serializer,
            node_id,
            claim_timeout: self.claim_timeout.unwrap_or(Duration::from_secs(10)),
        })
    }
}

/// `<pid>@<hostname>`, falling back to `localhost`.
pub fn default_node_id() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}@{}", std::process::id(), host)
}

impl TokenStore {
    pub fn builder() -> TokenStoreBuilder {
        TokenStoreBuilder::default()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn claim_timeout(&self) -> Duration {
        self.claim_timeout
    }

    pub fn entity_manager_provider(&self) -> &Arc<EntityManagerProvider> {
        &self.entity_manager_provider
    }

    fn entity_manager(&self) -> &EntityManager {
        self.entity_manager_provider.entity_manager()
    }

    /// Creates `segment_count` unclaimed segments holding `initial_token`.
    /// Fails if the processor already has any token.
    pub async fn initialize_token_segments<T: Serialize + Sync>(
        &self,
        uow: &mut UnitOfWork,
        processor_name: &str,
        segment_count: i32,
        initial_token: Option<&T>,
    ) -> Result<(), InfraError> {
        let existing = self.fetch_segments(uow, processor_name).await?;
        if !existing.is_empty() {
            return Err(InfraError::UnableToInitializeTokens {
                processor: processor_name.to_string(),
                reason: format!("{} segment(s) already exist", existing.len()),
            });
        }
        for segment in 0..segment_count {
            let entry = self.new_entry(processor_name, segment, initial_token)?;
            self.entity_manager().persist(uow, &entry).await?;
        }
        info!(processor = processor_name, segment_count, "token segments initialized");
        Ok(())
    }

    /// Creates one unclaimed segment unless it exists. Returns whether a row
    /// was created.
    pub async fn initialize_segment_if_absent<T: Serialize + Sync>(
        &self,
        uow: &mut UnitOfWork,
        processor_name: &str,
        segment: i32,
        initial_token: Option<&T>,
    ) -> Result<bool, InfraError> {
        let id = (processor_name.to_string(), segment);
        if self.entity_manager().find::<TokenEntry>(uow, &id).await?.is_some() {
            return Ok(false);
        }
        let entry = self.new_entry(processor_name, segment, initial_token)?;
        match self.entity_manager().persist(uow, &entry).await {
            Ok(()) => Ok(true),
            Err(e) if e.persistence_kind() == Some(ErrorKind::ConstraintViolation) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Claims the segment for this node and returns its token.
    pub async fn fetch_token<T: DeserializeOwned>(
        &self,
        uow: &mut UnitOfWork,
        processor_name: &str,
        segment: i32,
    ) -> Result<Option<T>, InfraError> {
        let mut entry = self.load_claimable(uow, processor_name, segment).await?;
        entry.owner = Some(self.node_id.clone());
        entry.timestamp = Utc::now();
        self.entity_manager().merge(uow, &entry).await?;
        debug!(processor = processor_name, segment, node = %self.node_id, "token claimed");
        entry
            .token
            .as_deref()
            .map(|data| deserialize_object(self.serializer.as_ref(), data))
            .transpose()
    }

    /// Stores a new token; only the claim owner, or anyone once the claim is
    /// free or expired, may do so.
    pub async fn store_token<T: Serialize + Sync>(
        &self,
        uow: &mut UnitOfWork,
        token: Option<&T>,
        processor_name: &str,
        segment: i32,
    ) -> Result<(), InfraError> {
        self.load_claimable(uow, processor_name, segment).await?;
        let mut entry = self.new_entry(processor_name, segment, token)?;
        entry.owner = Some(self.node_id.clone());
        self.entity_manager().merge(uow, &entry).await
    }

    pub async fn extend_claim(
        &self,
        uow: &mut UnitOfWork,
        processor_name: &str,
        segment: i32,
    ) -> Result<(), InfraError> {
        let updated = self
            .owned_update(
                uow,
                "UPDATE token_entry SET timestamp = ? WHERE processor_name = ? AND segment = ? AND owner = ?",
                Some(Utc::now()),
                processor_name,
                segment,
            )
            .await?;
        if updated == 0 {
            return Err(self.claim_error(processor_name, segment, "claim is not owned by this node"));
        }
        Ok(())
    }

    /// Gives up this node's claim. Releasing a claim held by another node is
    /// a no-op.
    pub async fn release_claim(
        &self,
        uow: &mut UnitOfWork,
        processor_name: &str,
        segment: i32,
    ) -> Result<(), InfraError> {
        let updated = self
            .owned_update(
                uow,
                "UPDATE token_entry SET owner = NULL, timestamp = ? WHERE processor_name = ? AND segment = ? AND owner = ?",
                Some(Utc::now()),
                processor_name,
                segment,
            )
            .await?;
        if updated == 0 {
            warn!(
                processor = processor_name,
                segment,
                node = %self.node_id,
                "release of a claim not owned by this node ignored"
            );
        }
        Ok(())
    }

    /// Deletes the segment; requires this node to hold the claim.
    pub async fn delete_token(
        &self,
        uow: &mut UnitOfWork,
        processor_name: &str,
        segment: i32,
    ) -> Result<(), InfraError> {
        let deleted = self
            .owned_update(
                uow,
                "DELETE FROM token_entry WHERE processor_name = ? AND segment = ? AND owner = ?",
                None,
                processor_name,
                segment,
            )
            .await?;
        if deleted == 0 {
            return Err(self.claim_error(processor_name, segment, "claim is not owned by this node"));
        }
        Ok(())
    }

    pub async fn fetch_segments(
        &self,
        uow: &mut UnitOfWork,
        processor_name: &str,
    ) -> Result<Vec<i32>, InfraError> {
        let rows: Vec<(i32,)> = sqlx::query_as(
            "SELECT segment FROM token_entry WHERE processor_name = ? ORDER BY segment",
        )
        .bind(processor_name)
        .fetch_all(uow.connection())
        .await
        .map_err(|e| self.entity_manager().resolver().translate(e))?;
        Ok(rows.into_iter().map(|(segment,)| segment).collect())
    }

    /// Current owner of a segment, if any.
    pub async fn owner(
        &self,
        uow: &mut UnitOfWork,
        processor_name: &str,
        segment: i32,
    ) -> Result<Option<String>, InfraError> {
        let id = (processor_name.to_string(), segment);
        Ok(self
            .entity_manager()
            .find::<TokenEntry>(uow, &id)
            .await?
            .and_then(|entry| entry.owner))
    }

    async fn load_claimable(
        &self,
        uow: &mut UnitOfWork,
        processor_name: &str,
        segment: i32,
    ) -> Result<TokenEntry, InfraError> {
        let id = (processor_name.to_string(), segment);
        let entry = self
            .entity_manager()
            .find::<TokenEntry>(uow, &id)
            .await?
            .ok_or_else(|| self.claim_error(processor_name, segment, "no token exists"))?;
        let expired_before = Utc::now() - self.claim_timeout_delta();
        if !entry.is_claimable_by(&self.node_id, expired_before) {
            let owner = entry.owner.clone().unwrap_or_default();
            return Err(self.claim_error(
                processor_name,
                segment,
                &format!("claimed by `{owner}`"),
            ));
        }
        Ok(entry)
    }

    /// Runs an ownership-guarded statement. Placeholders are, in order: the
    /// optional timestamp, processor name, segment, owner.
    async fn owned_update(
        &self,
        uow: &mut UnitOfWork,
        sql: &str,
        timestamp: Option<DateTime<Utc>>,
        processor_name: &str,
        segment: i32,
    ) -> Result<u64, InfraError> {
        let mut query = sqlx::query(sql);
        if let Some(timestamp) = timestamp {
            query = query.bind(timestamp);
        }
        let done = query
            .bind(processor_name)
            .bind(segment)
            .bind(self.node_id.as_str())
            .execute(uow.connection())
            .await
            .map_err(|e| self.entity_manager().resolver().translate(e))?;
        Ok(done.rows_affected())
    }

    fn new_entry<T: Serialize>(
        &self,
        processor_name: &str,
        segment: i32,
        token: Option<&T>,
    ) -> Result<TokenEntry, InfraError> {
        let serialized = token
            .map(|t| serialize_object(self.serializer.as_ref(), t))
            .transpose()?;
        let (token, token_type) = match serialized {
            Some(s) => (Some(s.data), Some(s.type_name)),
            None => (None, None),
        };
        Ok(TokenEntry {
            processor_name: processor_name.to_string(),
            segment,
            token,
            token_type,
            timestamp: Utc::now(),
            owner: None,
        })
    }

    fn claim_timeout_delta(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.claim_timeout.as_millis().min(i64::MAX as u128) as i64)
    }

    fn claim_error(&self, processor_name: &str, segment: i32, reason: &str) -> InfraError {
        InfraError::UnableToClaimToken {
            processor: processor_name.to_string(),
            segment,
            reason: reason.to_string(),
        }
    }
}
