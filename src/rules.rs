// src/rules.rs

use crate::file_persistence::StorageCapacity;
use crate::status::DownloadBatchStatus;
use std::sync::Arc;
use tracing::warn;

pub const STORAGE_RULE_CODE: i32 = 1;
pub const STORAGE_PERCENTAGE_RULE_CODE: i32 = 2;

/// A precondition a batch must satisfy to keep downloading.
pub trait DownloadBatchRequirementRule: Send + Sync {
    fn has_violated_rule(&self, status: &DownloadBatchStatus) -> bool;
    fn code(&self) -> i32;
}

/// Evaluates rules in registration order.
#[derive(Clone, Default)]
pub struct DownloadBatchRequirementRules {
    rules: Vec<Arc<dyn DownloadBatchRequirementRule>>,
}

impl DownloadBatchRequirementRules {
    pub fn new(rules: Vec<Arc<dyn DownloadBatchRequirementRule>>) -> Self {
        Self { rules }
    }

    pub fn push(&mut self, rule: Arc<dyn DownloadBatchRequirementRule>) {
        self.rules.push(rule);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn has_violated_rule(&self, status: &DownloadBatchStatus) -> bool {
        self.get_violated_rule(status).is_some()
    }

    /// The first violated rule, if any.
    pub fn get_violated_rule(
        &self,
        status: &DownloadBatchStatus,
    ) -> Option<Arc<dyn DownloadBatchRequirementRule>> {
        self.rules
            .iter()
            .find(|rule| rule.has_violated_rule(status))
            .cloned()
    }
}

enum Margin {
    Bytes(u64),
    /// Percentage of the volume's total size that must stay free.
    Percentage(u8),
}

/// Violated when the bytes still to download would eat into a reserved margin
/// of the batch's storage volume.
pub struct StorageRequirementRule {
    capacity: Arc<dyn StorageCapacity>,
    margin: Margin,
}

impl StorageRequirementRule {
    pub fn with_bytes(capacity: Arc<dyn StorageCapacity>, reserved_bytes: u64) -> Self {
        Self {
            capacity,
            margin: Margin::Bytes(reserved_bytes),
        }
    }

    pub fn with_percentage(capacity: Arc<dyn StorageCapacity>, percentage: u8) -> Self {
        Self {
            capacity,
            margin: Margin::Percentage(percentage.min(100)),
        }
    }
}

impl DownloadBatchRequirementRule for StorageRequirementRule {
    fn has_violated_rule(&self, status: &DownloadBatchStatus) -> bool {
        let Some(total) = status.bytes_total_size else {
            return false;
        };
        let remaining = total.saturating_sub(status.bytes_downloaded);
        let root = status.storage_root.as_path();

        let usable = match self.capacity.usable_space(root) {
            Ok(usable) => usable,
            Err(err) => {
                warn!(path = %root.display(), error = %err, "could not read usable space");
                return false;
            }
        };
        let reserved = match self.margin {
            Margin::Bytes(bytes) => bytes,
            Margin::Percentage(percentage) => match self.capacity.total_space(root) {
                Ok(volume) => volume / 100 * u64::from(percentage),
                Err(err) => {
                    warn!(path = %root.display(), error = %err, "could not read volume size");
                    return false;
                }
            },
        };

        usable.saturating_sub(reserved) < remaining
    }

    fn code(&self) -> i32 {
        match self.margin {
            Margin::Bytes(_) => STORAGE_RULE_CODE,
            Margin::Percentage(_) => STORAGE_PERCENTAGE_RULE_CODE,
        }
    }
}
