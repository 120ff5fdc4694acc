use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Case-insensitive token address comparison. Provider responses mix
/// checksummed and lowercased hex addresses for the same contract.
pub fn is_same_address(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// `(chain, address)` identity of a token.
///
/// The address is normalized to lowercase on construction so the derived
/// `Eq`/`Hash` match the case-insensitive equality the provider implies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenId {
    pub chain: String,
    pub address: String,
}

impl TokenId {
    pub fn new(chain: &str, address: &str) -> Self {
        Self {
            chain: chain.to_string(),
            address: address.to_ascii_lowercase(),
        }
    }

    /// Wire form used by the provider's by-identity lookup (`chain:address`).
    pub fn as_query_param(&self) -> String {
        format!("{}:{}", self.chain, self.address)
    }
}

/// Token holding from the provider API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub chain: String,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub decimals: Option<u32>,
    #[serde(default)]
    pub amount: Decimal,
    pub price: Option<Decimal>,
    #[serde(default)]
    pub is_core: bool,
    /// Set once a historical comparison has been applied to this token's
    /// owning chain group. Never part of the wire format.
    #[serde(skip)]
    pub history_patched: bool,
}

impl TokenItem {
    pub fn identity(&self) -> TokenId {
        TokenId::new(&self.chain, &self.id)
    }

    /// A token the provider no longer recognizes comes back without an id
    /// or chain; such rows are excluded from every displayed set.
    pub fn has_identity(&self) -> bool {
        !self.id.is_empty() && !self.chain.is_empty()
    }

    pub fn usd_value(&self) -> Decimal {
        self.amount * self.price.unwrap_or_default()
    }

    pub fn matches(&self, id: &TokenId) -> bool {
        self.chain == id.chain && is_same_address(&self.id, &id.address)
    }
}
