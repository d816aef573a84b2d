//! Host-wide per-model concurrency slots over the shared `slots` key.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::NoSlotAvailable;
use crate::io::config::ConcurrencyConfig;
use crate::io::pid::{current_pid, is_alive};
use crate::io::store::{FileStore, Store};

pub const SLOTS_KEY: &str = "slots";

static SLOT_SEQ: AtomicU64 = AtomicU64::new(0);

/// A held slot, tagged with its owning process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotToken {
    pub id: String,
    pub pid: u32,
    pub acquired_at: i64,
}

/// Model -> held tokens.
pub type SlotTable = BTreeMap<String, Vec<SlotToken>>;

/// A slot granted to this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub model: String,
    pub token: String,
}

pub struct SlotManager<'a> {
    store: &'a FileStore,
    limits: &'a ConcurrencyConfig,
}

impl<'a> SlotManager<'a> {
    pub fn new(store: &'a FileStore, limits: &'a ConcurrencyConfig) -> Self {
        Self { store, limits }
    }

    /// Take a slot for `model` if fewer than its limit are held. Dead holders
    /// are reclaimed inside the same locked update, before the count.
    pub fn acquire(&self, model: &str) -> Result<Slot> {
        let limit = self.limits.limit_for(model);
        let pid = current_pid();
        let token = format!(
            "{pid}-{}-{}",
            Utc::now().timestamp_millis(),
            SLOT_SEQ.fetch_add(1, Ordering::Relaxed)
        );

        let mut full = false;
        let mut reclaimed = 0;
        self.store.update(SLOTS_KEY, |table: &mut SlotTable| {
            reclaimed = drop_dead(table);
            let held = table.entry(model.to_string()).or_default();
            if held.len() >= limit {
                full = true;
                return Ok(());
            }
            held.push(SlotToken {
                id: token.clone(),
                pid,
                acquired_at: Utc::now().timestamp(),
            });
            Ok(())
        })?;
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed slots held by dead processes");
        }
        if full {
            return Err(NoSlotAvailable {
                model: model.to_string(),
                limit,
            }
            .into());
        }
        debug!(model, token = %token, limit, "slot acquired");
        Ok(Slot {
            model: model.to_string(),
            token,
        })
    }

    /// Remove exactly this slot's token.
    pub fn release(&self, slot: &Slot) -> Result<()> {
        release_slot(self.store, slot)
    }

    /// Drop every token whose owner is no longer running.
    pub fn reclaim_stale(&self) -> Result<usize> {
        let mut reclaimed = 0;
        self.store.update(SLOTS_KEY, |table: &mut SlotTable| {
            reclaimed = drop_dead(table);
            Ok(())
        })?;
        Ok(reclaimed)
    }

    /// Held slot counts per model.
    pub fn usage(&self) -> Result<BTreeMap<String, usize>> {
        let table: SlotTable = self.store.read(SLOTS_KEY)?;
        Ok(table.into_iter().map(|(m, held)| (m, held.len())).collect())
    }
}

fn release_slot(store: &FileStore, slot: &Slot) -> Result<()> {
    store.update(SLOTS_KEY, |table: &mut SlotTable| {
        if let Some(held) = table.get_mut(&slot.model) {
            held.retain(|t| t.id != slot.token);
            if held.is_empty() {
                table.remove(&slot.model);
            }
        }
        Ok(())
    })?;
    debug!(model = %slot.model, token = %slot.token, "slot released");
    Ok(())
}

fn drop_dead(table: &mut SlotTable) -> usize {
    let mut dropped = 0;
    for held in table.values_mut() {
        let before = held.len();
        held.retain(|t| is_alive(t.pid));
        dropped += before - held.len();
    }
    table.retain(|_, held| !held.is_empty());
    dropped
}

/// Releases its slot on drop.
pub struct SlotGuard {
    store: FileStore,
    slot: Option<Slot>,
}

impl SlotGuard {
    pub fn acquire(
        store: &FileStore,
        limits: &ConcurrencyConfig,
        model: &str,
    ) -> Result<SlotGuard> {
        let slot = SlotManager::new(store, limits).acquire(model)?;
        Ok(SlotGuard {
            store: store.clone(),
            slot: Some(slot),
        })
    }

    pub fn slot(&self) -> Option<&Slot> {
        self.slot.as_ref()
    }

    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        match self.slot.take() {
            Some(slot) => release_slot(&self.store, &slot),
            None => Ok(()),
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(err = %err, "failed to release concurrency slot");
        }
    }
}
