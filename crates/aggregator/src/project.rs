use std::collections::{BTreeSet, HashMap};

use common::types::{TokenId, TokenItem};
use rust_decimal::Decimal;

/// One chain's slice of the aggregate view.
///
/// Tokens are unique by `(chain, address)` identity; replacing the token
/// sequence never duplicates an identity. `history_tokens` is the secondary
/// history-only dataset from a backfill and never contributes to net worth.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainPortfolio {
    pub chain: String,
    pub tokens: Vec<TokenItem>,
    pub history_tokens: Vec<TokenItem>,
    pub net_worth_change: Decimal,
    pub history_patched: bool,
}

impl ChainPortfolio {
    fn new(chain: &str) -> Self {
        Self {
            chain: chain.to_string(),
            ..Self::default()
        }
    }

    /// Current chain value over core tokens.
    pub fn core_value(&self) -> Decimal {
        self.tokens
            .iter()
            .filter(|t| t.is_core)
            .map(TokenItem::usd_value)
            .sum()
    }

    fn historical_value(&self) -> Decimal {
        self.history_tokens
            .iter()
            .filter(|t| t.is_core)
            .map(TokenItem::usd_value)
            .sum()
    }

    /// Replace the token sequence. Later entries win on identity collision;
    /// ordering is descending `amount x price`.
    fn replace_tokens(&mut self, tokens: Vec<TokenItem>) {
        let mut by_identity: HashMap<TokenId, TokenItem> = HashMap::with_capacity(tokens.len());
        for mut token in tokens {
            token.history_patched = self.history_patched;
            by_identity.insert(token.identity(), token);
        }
        let mut tokens: Vec<TokenItem> = by_identity.into_values().collect();
        tokens.sort_by(|a, b| {
            b.usd_value()
                .cmp(&a.usd_value())
                .then_with(|| a.id.cmp(&b.id))
        });
        self.tokens = tokens;
    }

    fn mark_patched(&mut self, change: Decimal) {
        self.net_worth_change = change;
        self.history_patched = true;
        for token in &mut self.tokens {
            token.history_patched = true;
        }
    }
}

/// The aggregate view for one account: chain portfolios plus the derived
/// totals. All updates build a new `Project` from the previous one, so a
/// published value is never partially updated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Project {
    pub net_worth: Decimal,
    pub net_worth_change: Decimal,
    pub portfolios: HashMap<String, ChainPortfolio>,
}

impl Project {
    /// Replace the token sequences of the chains present in
    /// `tokens_by_chain` and recompute net worth from scratch. Chains absent
    /// from the input are left untouched. Idempotent.
    pub fn merge(&self, tokens_by_chain: &HashMap<String, Vec<TokenItem>>) -> Project {
        let mut next = self.clone();
        for (chain, tokens) in tokens_by_chain {
            next.portfolios
                .entry(chain.clone())
                .or_insert_with(|| ChainPortfolio::new(chain))
                .replace_tokens(tokens.clone());
        }
        next.recompute();
        next
    }

    /// Merge historical balances as a secondary dataset. A chain that has
    /// historical data and is not yet patched gets its net-worth change
    /// computed from the historical holdings (`current - historical`) and is
    /// marked patched. Never touches `net_worth`. Chains without a live
    /// portfolio are ignored: nothing is held there now.
    pub fn merge_history(&self, history_by_chain: &HashMap<String, Vec<TokenItem>>) -> Project {
        let mut next = self.clone();
        for (chain, history) in history_by_chain {
            let Some(portfolio) = next.portfolios.get_mut(chain) else {
                continue;
            };
            portfolio.history_tokens = history.clone();
            if !portfolio.history_patched {
                let change = portfolio.core_value() - portfolio.historical_value();
                portfolio.mark_patched(change);
            }
        }
        next.recompute();
        next
    }

    /// Apply fetched historical unit prices to one chain. The historical
    /// chain value uses current amounts at historical prices; a token with
    /// no historical price falls back to its current price (zero delta).
    /// A no-op for unknown or already-patched chains, so repeated backfills
    /// cannot double-count a chain's change.
    pub fn patch_prices(&self, chain: &str, prices: &HashMap<String, Decimal>) -> Project {
        let mut next = self.clone();
        let Some(portfolio) = next.portfolios.get_mut(chain) else {
            return next;
        };
        if portfolio.history_patched {
            return next;
        }

        let historical: Decimal = portfolio
            .tokens
            .iter()
            .filter(|t| t.is_core)
            .map(|t| {
                let unit = prices
                    .get(&t.id.to_ascii_lowercase())
                    .copied()
                    .or(t.price)
                    .unwrap_or_default();
                t.amount * unit
            })
            .sum();
        let change = portfolio.core_value() - historical;
        portfolio.mark_patched(change);
        next.recompute();
        next
    }

    /// Tokens with a non-empty identity whose owning chain has not been
    /// patched yet, grouped by chain. These are the tokens a backfill still
    /// needs historical prices for.
    pub fn missed_history_tokens(&self) -> HashMap<String, BTreeSet<String>> {
        let mut missed: HashMap<String, BTreeSet<String>> = HashMap::new();
        for portfolio in self.portfolios.values() {
            if portfolio.history_patched {
                continue;
            }
            for token in &portfolio.tokens {
                if token.has_identity() {
                    missed
                        .entry(portfolio.chain.clone())
                        .or_default()
                        .insert(token.id.to_ascii_lowercase());
                }
            }
        }
        missed
    }

    /// Aggregate change over patched chains; absent until at least one chain
    /// has been patched.
    pub fn patched_change(&self) -> Option<Decimal> {
        if self.portfolios.values().any(|p| p.history_patched) {
            Some(self.net_worth_change)
        } else {
            None
        }
    }

    /// Chain portfolios in display order (descending core value).
    pub fn sorted_portfolios(&self) -> Vec<&ChainPortfolio> {
        let mut portfolios: Vec<&ChainPortfolio> = self.portfolios.values().collect();
        portfolios.sort_by(|a, b| {
            b.core_value()
                .cmp(&a.core_value())
                .then_with(|| a.chain.cmp(&b.chain))
        });
        portfolios
    }

    /// Flattened display sequence: chains in display order, each chain's
    /// tokens already ordered by descending value.
    pub fn core_tokens(&self) -> Vec<TokenItem> {
        self.sorted_portfolios()
            .into_iter()
            .flat_map(|p| p.tokens.iter().cloned())
            .collect()
    }

    pub fn has_any_portfolio(&self) -> bool {
        self.portfolios.values().any(|p| !p.tokens.is_empty())
    }

    fn recompute(&mut self) {
        self.net_worth = self.portfolios.values().map(ChainPortfolio::core_value).sum();
        self.net_worth_change = self
            .portfolios
            .values()
            .filter(|p| p.history_patched)
            .map(|p| p.net_worth_change)
            .sum();
    }
}
