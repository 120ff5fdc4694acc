use common::types::TokenItem;
use rust_decimal::Decimal;

/// Read-only snapshot published to the presentation layer. Always a
/// complete value; readers never observe a half-merged aggregate.
#[derive(Debug, Clone, Default)]
pub struct PortfolioView {
    pub net_worth: Decimal,
    /// Absent until at least one chain's historical patch has been applied.
    pub net_worth_change: Option<Decimal>,
    pub is_loading: bool,
    pub core_tokens: Vec<TokenItem>,
    pub customized_tokens: Vec<TokenItem>,
    pub blocked_tokens: Vec<TokenItem>,
    pub has_any_portfolio: bool,
}

impl PortfolioView {
    pub fn display_net_worth(&self) -> String {
        format!("${:.2}", self.net_worth)
    }

    /// `-` until a historical patch lands, then a signed dollar figure.
    pub fn display_net_worth_change(&self) -> String {
        match self.net_worth_change {
            None => "-".to_string(),
            Some(change) if change >= Decimal::ZERO => format!("+${change:.2}"),
            Some(change) => format!("-${:.2}", change.abs()),
        }
    }

    /// Change relative to the historical net worth, e.g. `+12.50%`. Empty
    /// until patched or when the historical base is zero.
    pub fn display_change_percent(&self) -> String {
        let Some(change) = self.net_worth_change else {
            return String::new();
        };
        let base = self.net_worth - change;
        if base == Decimal::ZERO {
            return String::new();
        }
        let percent = change / base * Decimal::from(100);
        if percent >= Decimal::ZERO {
            format!("+{percent:.2}%")
        } else {
            format!("{percent:.2}%")
        }
    }
}
