use serde::{Deserialize, Serialize};

/// A tradable symbol tracked by the system: a listed company or a market index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    /// Exchange code, e.g. `BHP` or `^AORD`. Compared case-insensitively.
    pub symbol: String,
    /// Industry group for companies, empty for indices.
    pub group: String,
}

impl Entity {
    pub fn new(name: impl Into<String>, symbol: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbol: symbol.into(),
            group: group.into(),
        }
    }

    /// Normalized key used for case-insensitive symbol comparisons.
    pub fn symbol_key(&self) -> String {
        self.symbol.trim().to_uppercase()
    }
}
