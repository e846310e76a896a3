//! Read-through cache of per-user [`CreditStats`].
//!
//! Only the `stats`/`get_balance` reads are served from the cache. Every call
//! that can move a user's numbers evicts that user's entry, and the atomic
//! `debit`/`reserve` checks always go to the wrapped store.

use crate::{
    db::models::{
        credits::{CreditStats, CreditTransactionCreateDBRequest, CreditTransactionDBResponse},
        reservations::{ReservationCreateDBRequest, ReservationDBResponse, SettlementMetadata, SettlementOutcome},
    },
    errors::Result,
    ledger::store::LedgerStore,
    types::{ReservationId, TransactionId, UserId},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::trace;

/// Past this many entries a cache fill first drops everything already expired
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Default)]
struct Entries {
    /// Bumped on every eviction so a read that raced a write doesn't repopulate stale numbers
    epoch: u64,
    stats: HashMap<UserId, (Instant, CreditStats)>,
}

pub struct CachedLedgerStore {
    inner: Arc<dyn LedgerStore>,
    ttl: Duration,
    entries: RwLock<Entries>,
}

impl CachedLedgerStore {
    pub fn new(inner: Arc<dyn LedgerStore>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: RwLock::default(),
        }
    }

    pub async fn invalidate(&self, user_id: UserId) {
        let mut entries = self.entries.write().await;
        entries.epoch += 1;
        entries.stats.remove(&user_id);
        trace!(%user_id, "Evicted cached credit stats");
    }

    async fn cached(&self, user_id: UserId) -> (u64, Option<CreditStats>) {
        let entries = self.entries.read().await;
        let fresh = entries
            .stats
            .get(&user_id)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, stats)| *stats);
        (entries.epoch, fresh)
    }

    async fn fill(&self, user_id: UserId, epoch: u64, stats: CreditStats) {
        let mut entries = self.entries.write().await;
        if entries.epoch != epoch {
            return;
        }
        if entries.stats.len() >= PRUNE_THRESHOLD {
            let ttl = self.ttl;
            entries.stats.retain(|_, (at, _)| at.elapsed() < ttl);
        }
        entries.stats.insert(user_id, (Instant::now(), stats));
    }

    #[cfg(test)]
    async fn cached_users(&self) -> usize {
        self.entries.read().await.stats.len()
    }
}

#[async_trait]
impl LedgerStore for CachedLedgerStore {
    async fn stats(&self, user_id: UserId) -> Result<CreditStats> {
        let (epoch, cached) = self.cached(user_id).await;
        if let Some(stats) = cached {
            trace!(%user_id, "Credit stats cache hit");
            return Ok(stats);
        }

        let stats = self.inner.stats(user_id).await?;
        self.fill(user_id, epoch, stats).await;
        Ok(stats)
    }

    async fn append_transaction(&self, request: &CreditTransactionCreateDBRequest) -> Result<CreditTransactionDBResponse> {
        let result = self.inner.append_transaction(request).await;
        self.invalidate(request.user_id).await;
        result
    }

    async fn debit(&self, request: &CreditTransactionCreateDBRequest) -> Result<CreditTransactionDBResponse> {
        let result = self.inner.debit(request).await;
        self.invalidate(request.user_id).await;
        result
    }

    async fn reserve(&self, request: &ReservationCreateDBRequest) -> Result<ReservationDBResponse> {
        let result = self.inner.reserve(request).await;
        self.invalidate(request.user_id).await;
        result
    }

    async fn confirm_reservation(&self, id: ReservationId, metadata: &SettlementMetadata) -> Result<SettlementOutcome> {
        let outcome = self.inner.confirm_reservation(id, metadata).await?;
        self.invalidate(outcome.reservation().user_id).await;
        Ok(outcome)
    }

    async fn cancel_reservation(&self, id: ReservationId, reason: &str) -> Result<SettlementOutcome> {
        let outcome = self.inner.cancel_reservation(id, reason).await?;
        self.invalidate(outcome.reservation().user_id).await;
        Ok(outcome)
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<ReservationDBResponse>> {
        self.inner.get_reservation(id).await
    }

    async fn list_transactions(&self, user_id: Option<UserId>, skip: i64, limit: i64) -> Result<Vec<CreditTransactionDBResponse>> {
        self.inner.list_transactions(user_id, skip, limit).await
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<CreditTransactionDBResponse>> {
        self.inner.get_transaction(id).await
    }

    async fn expire_reservations(&self, now: DateTime<Utc>) -> Result<Vec<ReservationDBResponse>> {
        let expired = self.inner.expire_reservations(now).await?;
        for reservation in &expired {
            self.invalidate(reservation.user_id).await;
        }
        Ok(expired)
    }
}
