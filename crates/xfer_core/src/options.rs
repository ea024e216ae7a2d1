use serde::{Deserialize, Serialize};

/// Strategy-specific knobs attached to a transfer request. The aggregate
/// treats this as opaque; only the selected strategy interprets it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferOptions {
    /// Table allow-list for SQL sources. Empty means the whole database.
    #[serde(default)]
    pub tables: Vec<String>,
    /// Collection allow-list for MongoDB sources. Empty means the whole
    /// database.
    #[serde(default)]
    pub collections: Vec<String>,
    /// Whether clone actions carry persistent-volume definitions over.
    #[serde(default = "default_true")]
    pub include_volumes: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            collections: Vec::new(),
            include_volumes: true,
        }
    }
}
