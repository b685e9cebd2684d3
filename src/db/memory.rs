//! In-process store with the same semantics as [`super::PgStore`]

use alloy::primitives::U256;
use async_trait::async_trait;
use eyre::Result;
use std::collections::HashMap;
use std::sync::Mutex;

use super::TransferStore;
use crate::types::{Status, StatusCounts, TransferRecord};

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<U256, TransferRecord>>,
    cursors: Mutex<HashMap<u64, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, ordered by source position
    pub fn records(&self) -> Vec<TransferRecord> {
        let mut records: Vec<_> = self.lock_records().values().cloned().collect();
        records.sort_by_key(|r| r.event.position());
        records
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, HashMap<U256, TransferRecord>> {
        // A poisoned lock only means a test thread panicked mid-update
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn upsert(&self, record: &TransferRecord) -> Result<()> {
        self.lock_records().insert(record.nonce(), record.clone());
        Ok(())
    }

    async fn insert_if_absent(&self, record: &TransferRecord) -> Result<bool> {
        let mut records = self.lock_records();
        if records.contains_key(&record.nonce()) {
            return Ok(false);
        }
        records.insert(record.nonce(), record.clone());
        Ok(true)
    }

    async fn get_by_nonce(&self, nonce: U256) -> Result<Option<TransferRecord>> {
        Ok(self.lock_records().get(&nonce).cloned())
    }

    async fn list_by_status(&self, status: Status, limit: i64) -> Result<Vec<TransferRecord>> {
        let mut matching: Vec<_> = self
            .lock_records()
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.event.position());
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn compare_and_set(
        &self,
        current: &TransferRecord,
        next: &TransferRecord,
    ) -> Result<bool> {
        let mut records = self.lock_records();
        match records.get_mut(&current.nonce()) {
            Some(stored)
                if stored.status == current.status
                    && stored.attempt_count == current.attempt_count =>
            {
                *stored = next.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for record in self.lock_records().values() {
            counts.add(record.status, 1);
        }
        Ok(counts)
    }

    async fn load_cursor(&self, chain_id: u64) -> Result<Option<u64>> {
        Ok(self
            .cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&chain_id)
            .copied())
    }

    async fn save_cursor(&self, chain_id: u64, last_processed_block: u64) -> Result<()> {
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        let cursor = cursors.entry(chain_id).or_insert(last_processed_block);
        *cursor = (*cursor).max(last_processed_block);
        Ok(())
    }
}
