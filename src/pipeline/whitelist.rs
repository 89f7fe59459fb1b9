//! Sender whitelist

use async_trait::async_trait;
use std::collections::HashSet;

/// Decides which senders may issue commands
#[async_trait]
pub trait SenderWhitelist: Send + Sync {
    async fn is_whitelisted(&self, sender: &str) -> bool;
}

/// Fixed set of sender ids, loaded from config
#[derive(Debug, Clone, Default)]
pub struct StaticWhitelist {
    senders: HashSet<String>,
}

impl StaticWhitelist {
    pub fn new<I, S>(senders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            senders: senders
                .into_iter()
                .map(|s| s.into().trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

#[async_trait]
impl SenderWhitelist for StaticWhitelist {
    async fn is_whitelisted(&self, sender: &str) -> bool {
        self.senders.contains(sender.trim())
    }
}
