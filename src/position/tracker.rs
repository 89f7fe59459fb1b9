//! Position tracking
//!
//! Net lots per instrument, derived from confirmed order outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::broker::{Fill, InstrumentId};
use crate::command::Contract;
use crate::error::{Error, Result};

/// Net holding in one instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub instrument_id: InstrumentId,
    pub contract: Contract,
    /// Positive long, negative short, zero flat
    pub net_lots: i64,
    /// Bumped on every applied order, so each close of a position is distinct
    #[serde(default)]
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.net_lots == 0
    }
}

/// Disagreement between tracked and broker-reported lots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionDrift {
    pub instrument_id: InstrumentId,
    /// Unknown when the broker reports an instrument we never traded
    pub contract: Option<Contract>,
    pub tracked_lots: i64,
    pub broker_lots: i64,
}

impl PositionDrift {
    pub fn difference(&self) -> i64 {
        self.broker_lots - self.tracked_lots
    }
}

/// Position tracker
pub struct PositionTracker {
    positions: Arc<RwLock<BTreeMap<InstrumentId, Position>>>,
    persistence_path: Option<PathBuf>,
}

impl PositionTracker {
    pub fn new(persistence_path: Option<PathBuf>) -> Self {
        Self {
            positions: Arc::new(RwLock::new(BTreeMap::new())),
            persistence_path,
        }
    }

    /// Load positions from disk
    pub async fn load(&self) -> Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::PositionPersistence(e.to_string()))?;
        let stored: Vec<Position> = serde_json::from_str(&data)
            .map_err(|e| Error::PositionPersistence(e.to_string()))?;

        let mut guard = self.positions.write().await;
        *guard = stored
            .into_iter()
            .map(|p| (p.instrument_id.clone(), p))
            .collect();

        info!("Loaded {} positions from {}", guard.len(), path.display());
        Ok(())
    }

    async fn persist(&self, positions: &BTreeMap<InstrumentId, Position>) -> Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };

        let snapshot: Vec<&Position> = positions.values().collect();
        let data = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| Error::PositionPersistence(e.to_string()))?;

        tokio::fs::write(path, data)
            .await
            .map_err(|e| Error::PositionPersistence(e.to_string()))?;

        debug!("Saved {} positions to {}", positions.len(), path.display());
        Ok(())
    }

    /// Add `signed_lots` to the instrument's net position.
    ///
    /// Writers are serialized, including the save.
    pub async fn apply_result(
        &self,
        instrument_id: &InstrumentId,
        contract: &Contract,
        signed_lots: i64,
    ) -> Position {
        let mut positions = self.positions.write().await;

        let position = positions
            .entry(instrument_id.clone())
            .or_insert_with(|| Position {
                instrument_id: instrument_id.clone(),
                contract: contract.clone(),
                net_lots: 0,
                version: 0,
                updated_at: Utc::now(),
            });
        position.net_lots += signed_lots;
        position.version += 1;
        position.updated_at = Utc::now();
        let updated = position.clone();

        info!(
            instrument_id = %instrument_id,
            contract = %contract,
            delta = signed_lots,
            net_lots = updated.net_lots,
            "Position updated"
        );

        if let Err(e) = self.persist(&positions).await {
            error!(error = %e, "Failed to persist positions");
        }
        updated
    }

    /// All positions ordered by instrument id
    pub async fn snapshot(&self) -> Vec<Position> {
        self.positions.read().await.values().cloned().collect()
    }

    /// Non-flat positions ordered by instrument id
    pub async fn open_positions(&self) -> Vec<Position> {
        self.positions
            .read()
            .await
            .values()
            .filter(|p| !p.is_flat())
            .cloned()
            .collect()
    }

    /// First non-flat position for a contract
    pub async fn find_open(&self, contract: &Contract) -> Option<Position> {
        self.positions
            .read()
            .await
            .values()
            .find(|p| !p.is_flat() && &p.contract == contract)
            .cloned()
    }

    pub async fn get(&self, instrument_id: &InstrumentId) -> Option<Position> {
        self.positions.read().await.get(instrument_id).cloned()
    }

    /// Compare tracked positions against broker fills. Read-only.
    pub async fn reconcile(&self, fills: &[Fill]) -> Vec<PositionDrift> {
        let mut broker_lots: BTreeMap<InstrumentId, i64> = BTreeMap::new();
        for fill in fills {
            *broker_lots.entry(fill.instrument_id.clone()).or_default() += fill.signed_lots;
        }

        let positions = self.positions.read().await;
        let mut drift = Vec::new();

        for (id, position) in positions.iter() {
            let reported = broker_lots.remove(id).unwrap_or(0);
            if reported != position.net_lots {
                drift.push(PositionDrift {
                    instrument_id: id.clone(),
                    contract: Some(position.contract.clone()),
                    tracked_lots: position.net_lots,
                    broker_lots: reported,
                });
            }
        }
        for (id, reported) in broker_lots {
            if reported != 0 {
                drift.push(PositionDrift {
                    instrument_id: id,
                    contract: None,
                    tracked_lots: 0,
                    broker_lots: reported,
                });
            }
        }

        if drift.is_empty() {
            info!("Positions reconciled with broker");
        } else {
            warn!(count = drift.len(), "Position drift against broker fills");
        }
        drift.sort_by(|a, b| a.instrument_id.cmp(&b.instrument_id));
        drift
    }

    pub async fn position_count(&self) -> usize {
        self.positions.read().await.len()
    }
}
