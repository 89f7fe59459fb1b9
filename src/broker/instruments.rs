//! Instrument master resolver
//!
//! Loads a JSON array of instrument records that has already been filtered to
//! the expiry the operator wants to trade (one row per contract). Expiry
//! selection happens upstream of this file; rows that map the same contract
//! twice are rejected at load time.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::command::{Contract, OptionType};
use crate::error::{Error, ResolveError, Result};

use super::types::InstrumentId;
use super::InstrumentResolver;

/// One row of the instrument master file
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentRecord {
    pub underlying: String,
    pub strike: u32,
    pub option_type: OptionType,
    /// Broker's numeric token for the contract
    pub token: String,
}

/// In-memory contract -> instrument id table
#[derive(Debug, Default)]
pub struct InstrumentMaster {
    instruments: HashMap<Contract, InstrumentId>,
}

impl InstrumentMaster {
    pub fn from_records(records: impl IntoIterator<Item = InstrumentRecord>) -> Result<Self> {
        let mut instruments = HashMap::new();
        for record in records {
            let contract = Contract::new(
                record.underlying.to_uppercase(),
                record.strike,
                record.option_type,
            );
            if instruments
                .insert(contract.clone(), InstrumentId::new(record.token))
                .is_some()
            {
                return Err(Error::InstrumentMaster(format!(
                    "duplicate rows for {}",
                    contract
                )));
            }
        }
        Ok(Self { instruments })
    }

    /// Load from a JSON file
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::InstrumentMaster(format!("{}: {}", path.display(), e)))?;
        let records: Vec<InstrumentRecord> = serde_json::from_str(&data)
            .map_err(|e| Error::InstrumentMaster(format!("{}: {}", path.display(), e)))?;

        let master = Self::from_records(records)?;
        info!("Loaded {} instruments from {}", master.len(), path.display());
        Ok(master)
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

#[async_trait]
impl InstrumentResolver for InstrumentMaster {
    async fn resolve(&self, contract: &Contract) -> std::result::Result<InstrumentId, ResolveError> {
        self.instruments
            .get(contract)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(contract.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_load_and_resolve() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"underlying": "nifty", "strike": 24000, "option_type": "CE", "token": "43650"}},
                {{"underlying": "NIFTY", "strike": 24000, "option_type": "PE", "token": "43651"}}
            ]"#
        )
        .unwrap();

        let master = InstrumentMaster::load(file.path()).await.unwrap();
        assert_eq!(master.len(), 2);

        let call = Contract::new("NIFTY", 24000, OptionType::Call);
        assert_eq!(master.resolve(&call).await.unwrap(), InstrumentId::new("43650"));

        let missing = Contract::new("NIFTY", 24050, OptionType::Call);
        assert!(matches!(
            master.resolve(&missing).await,
            Err(ResolveError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_rows_rejected() {
        let row = InstrumentRecord {
            underlying: "NIFTY".into(),
            strike: 24000,
            option_type: OptionType::Call,
            token: "1".into(),
        };
        let result = InstrumentMaster::from_records(vec![row.clone(), row]);
        assert!(matches!(result, Err(Error::InstrumentMaster(_))));
    }
}
