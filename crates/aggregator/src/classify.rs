use std::collections::HashMap;

use common::types::{TokenId, TokenItem};

/// Result of partitioning a live token listing against the externally
/// maintained customized/blocked identity lists.
#[derive(Debug, Default)]
pub struct Classified {
    /// Tokens that belong in the project: the live result minus blocked
    /// identities. Customized tokens that hold a balance stay in here too.
    pub core: Vec<TokenItem>,
    /// Customized tokens that hold a balance.
    pub customized: Vec<TokenItem>,
    /// Blocked tokens that hold a balance.
    pub blocked: Vec<TokenItem>,
    /// Customized identities absent from the live result (zero balance);
    /// they need a supplementary by-identity lookup.
    pub missing_customized: Vec<TokenId>,
    /// Blocked identities absent from the live result.
    pub missing_blocked: Vec<TokenId>,
}

/// Partition `live` against the customized and blocked identity lists.
/// Tokens without a usable identity are dropped entirely.
pub fn classify(live: &[TokenItem], customized: &[TokenId], blocked: &[TokenId]) -> Classified {
    let mut result = Classified::default();

    for token in live {
        if !token.has_identity() {
            continue;
        }
        let is_blocked = blocked.iter().any(|id| token.matches(id));
        if customized.iter().any(|id| token.matches(id)) {
            result.customized.push(token.clone());
        }
        if is_blocked {
            result.blocked.push(token.clone());
        } else {
            result.core.push(token.clone());
        }
    }

    result.missing_customized = missing_identities(customized, &result.customized);
    result.missing_blocked = missing_identities(blocked, &result.blocked);
    result
}

fn missing_identities(wanted: &[TokenId], found: &[TokenItem]) -> Vec<TokenId> {
    wanted
        .iter()
        .filter(|id| !found.iter().any(|t| t.matches(id)))
        .cloned()
        .collect()
}

impl Classified {
    /// Fold the supplementary zero-balance lookup results in. A customized
    /// token with no balance is only displayed when the provider does not
    /// already count it as core; a blocked token with no balance is only
    /// worth surfacing when it is core (it would otherwise never show).
    /// Rows the provider no longer recognizes come back without an
    /// identity and are dropped.
    pub fn extend_with_zero_balance(
        &mut self,
        customized_lookup: Vec<TokenItem>,
        blocked_lookup: Vec<TokenItem>,
    ) {
        self.customized.extend(
            customized_lookup
                .into_iter()
                .filter(|t| t.has_identity() && !t.is_core),
        );
        self.blocked.extend(
            blocked_lookup
                .into_iter()
                .filter(|t| t.has_identity() && t.is_core),
        );
    }
}

/// Group tokens by their chain id, preserving input order within a chain.
pub fn group_by_chain(tokens: Vec<TokenItem>) -> HashMap<String, Vec<TokenItem>> {
    let mut by_chain: HashMap<String, Vec<TokenItem>> = HashMap::new();
    for token in tokens {
        by_chain.entry(token.chain.clone()).or_default().push(token);
    }
    by_chain
}
