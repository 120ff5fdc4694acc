use std::sync::Arc;

use common::types::TokenItem;
use rust_decimal::Decimal;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::classify::group_by_chain;
use crate::pipeline::PortfolioService;
use crate::providers::{HistoryQuery, PreferenceSource, SnapshotCache, TokenQuery};
use crate::session::LoadSession;

impl<P, S> PortfolioService<P, S>
where
    P: TokenQuery + HistoryQuery + Send + Sync + 'static,
    S: SnapshotCache + PreferenceSource + Send + Sync,
{
    /// Compute per-chain net-worth change against the configured historical
    /// timestamp and patch it into the live aggregate.
    ///
    /// Runs at most once per session (claimed through the session's history
    /// flag) and at most once per chain per project lifetime (guarded by the
    /// chain's `history_patched` flag), so repeated invocations can never
    /// double-count a chain's change. Chain patches apply in completion
    /// order; the aggregate accumulation is commutative.
    pub async fn run_backfill(&self, session: &Arc<LoadSession>) {
        let (address, time_at, blocked_ids) = {
            let st = self.state.lock().await;
            let Some(subject) = st.subject.clone() else {
                return;
            };
            let Some(time_at) = st.history_at else {
                return;
            };
            if st.project.net_worth == Decimal::ZERO {
                debug!("zero net worth; skipping history backfill");
                return;
            }
            (subject.address, time_at, st.blocked_ids.clone())
        };
        if session.is_cancelled() || !session.try_start_history() {
            return;
        }

        metrics::counter!("portfolio_history_backfills_total").increment(1);
        debug!(address = %address, time_at, "history backfill started");

        let history = match self.provider.fetch_history_tokens(&address, time_at).await {
            Ok(history) => history,
            Err(e) => {
                warn!(error = %e, "historical balance query failed; skipping backfill");
                metrics::counter!("portfolio_load_failures_total").increment(1);
                return;
            }
        };
        if session.is_cancelled() {
            return;
        }

        // Blocked identities stay out of the historical dataset, matching
        // their exclusion from current net worth.
        let history: Vec<TokenItem> = history
            .into_iter()
            .filter(|t| t.has_identity() && !blocked_ids.iter().any(|id| t.matches(id)))
            .collect();
        let groups = group_by_chain(history);
        if !self
            .commit(session, |st| st.project = st.project.merge_history(&groups))
            .await
        {
            return;
        }

        let missed = self.state.lock().await.project.missed_history_tokens();
        if missed.is_empty() {
            debug!("no missed tokens; history backfill complete");
            return;
        }

        let mut lookups = JoinSet::new();
        for (chain, ids) in missed {
            let provider = self.provider.clone();
            let ids: Vec<String> = ids.into_iter().collect();
            lookups.spawn(async move {
                let prices = provider.fetch_history_prices(&chain, &ids, time_at).await;
                (chain, prices)
            });
        }

        while let Some(joined) = lookups.join_next().await {
            let Ok((chain, prices)) = joined else {
                continue;
            };
            match prices {
                Ok(prices) => {
                    if session.is_cancelled() {
                        return;
                    }
                    let applied = self
                        .commit(session, |st| {
                            st.project = st.project.patch_prices(&chain, &prices);
                        })
                        .await;
                    if !applied {
                        return;
                    }
                    metrics::counter!("portfolio_history_patch_chains_total").increment(1);
                }
                Err(e) => {
                    // The chain stays unpatched; a later backfill for a new
                    // session can pick it up.
                    warn!(chain = %chain, error = %e, "historical price query failed");
                }
            }
        }
        debug!(address = %address, "history backfill finished");
    }
}
