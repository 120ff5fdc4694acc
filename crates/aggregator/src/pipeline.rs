use std::sync::Arc;

use common::types::{TokenId, TokenItem};
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::classify::{classify, group_by_chain};
use crate::project::Project;
use crate::providers::{HistoryQuery, PreferenceSource, SnapshotCache, TokenQuery};
use crate::session::{LoadSession, Subject};
use crate::view::PortfolioView;

/// Mutable pipeline state. Only ever touched while holding the service
/// lock, and only on behalf of a session that is still current.
pub(crate) struct PipelineState {
    pub(crate) subject: Option<Subject>,
    pub(crate) history_at: Option<i64>,
    pub(crate) session: Option<Arc<LoadSession>>,
    pub(crate) project: Project,
    pub(crate) customized: Vec<TokenItem>,
    pub(crate) blocked: Vec<TokenItem>,
    pub(crate) blocked_ids: Vec<TokenId>,
    pub(crate) is_loading: bool,
}

impl PipelineState {
    fn new() -> Self {
        Self {
            subject: None,
            history_at: None,
            session: None,
            project: Project::default(),
            customized: Vec::new(),
            blocked: Vec::new(),
            blocked_ids: Vec::new(),
            is_loading: false,
        }
    }
}

/// The aggregation pipeline for one consuming view.
///
/// A load is triggered by a subject change or an explicit refresh. The
/// pipeline paints the cached snapshot first, then supersedes it with the
/// live aggregation, and finally (if a historical timestamp is set) runs
/// the history backfill. Every state-publishing step checks the owning
/// session's cancellation token first, so a superseded load can never
/// clobber the current one.
pub struct PortfolioService<P, S> {
    pub(crate) provider: Arc<P>,
    pub(crate) store: Arc<S>,
    pub(crate) state: Mutex<PipelineState>,
    view_tx: watch::Sender<PortfolioView>,
}

impl<P, S> PortfolioService<P, S>
where
    P: TokenQuery + HistoryQuery + Send + Sync + 'static,
    S: SnapshotCache + PreferenceSource + Send + Sync,
{
    pub fn new(provider: Arc<P>, store: Arc<S>) -> Self {
        let (view_tx, _) = watch::channel(PortfolioView::default());
        Self {
            provider,
            store,
            state: Mutex::new(PipelineState::new()),
            view_tx,
        }
    }

    /// Read-only view stream. The receiver always holds the latest complete
    /// snapshot of the aggregate.
    pub fn subscribe(&self) -> watch::Receiver<PortfolioView> {
        self.view_tx.subscribe()
    }

    /// Switch the pipeline to a new subject. A no-op when the subject is
    /// unchanged; otherwise the active session is superseded and a full
    /// load runs for the new subject.
    pub async fn set_subject(&self, address: &str, chain: Option<&str>) {
        let subject = Subject::new(address, chain);
        let session = {
            let mut st = self.state.lock().await;
            if st.subject.as_ref() == Some(&subject) {
                return;
            }
            self.begin_session(&mut st, subject.clone())
        };
        self.run_load(&session, &subject).await;
    }

    /// Re-run the full load for the current subject.
    pub async fn refresh(&self) {
        let (session, subject) = {
            let mut st = self.state.lock().await;
            let Some(subject) = st.subject.clone() else {
                return;
            };
            (self.begin_session(&mut st, subject.clone()), subject)
        };
        self.run_load(&session, &subject).await;
    }

    /// Set or clear the historical comparison timestamp. When a load is in
    /// flight the backfill runs at its tail; otherwise it starts here for
    /// the active session.
    pub async fn set_history_at(&self, time_at: Option<i64>) {
        let session = {
            let mut st = self.state.lock().await;
            st.history_at = time_at;
            if time_at.is_none() || st.is_loading {
                None
            } else {
                st.session.clone()
            }
        };
        if let Some(session) = session {
            self.run_backfill(&session).await;
        }
    }

    /// Release the active session. Late results of in-flight work are
    /// silently dropped.
    pub async fn teardown(&self) {
        let mut st = self.state.lock().await;
        if let Some(session) = st.session.take() {
            session.cancel();
        }
    }

    /// Supersede the active session and reset the aggregate for a fresh
    /// load. Publishes the emptied view.
    fn begin_session(&self, st: &mut PipelineState, subject: Subject) -> Arc<LoadSession> {
        if let Some(old) = st.session.take() {
            old.cancel();
        }
        let session = LoadSession::new();
        st.session = Some(session.clone());
        st.subject = Some(subject);
        st.project = Project::default();
        st.customized.clear();
        st.blocked.clear();
        st.blocked_ids.clear();
        st.is_loading = true;
        self.publish_locked(st);
        session
    }

    /// Apply a state change and publish the resulting view, unless the
    /// owning session has been superseded in the meantime.
    pub(crate) async fn commit<F>(&self, session: &LoadSession, apply: F) -> bool
    where
        F: FnOnce(&mut PipelineState),
    {
        let mut st = self.state.lock().await;
        if session.is_cancelled() {
            return false;
        }
        apply(&mut st);
        self.publish_locked(&st);
        true
    }

    fn publish_locked(&self, st: &PipelineState) {
        let view = PortfolioView {
            net_worth: st.project.net_worth,
            net_worth_change: st.project.patched_change(),
            is_loading: st.is_loading,
            core_tokens: st.project.core_tokens(),
            customized_tokens: st.customized.clone(),
            blocked_tokens: st.blocked.clone(),
            has_any_portfolio: st.project.has_any_portfolio(),
        };
        metrics::gauge!("portfolio_net_worth").set(view.net_worth.to_f64().unwrap_or_default());
        self.view_tx.send_replace(view);
    }

    async fn run_load(&self, session: &Arc<LoadSession>, subject: &Subject) {
        metrics::counter!("portfolio_loads_total").increment(1);
        info!(address = %subject.address, chain = ?subject.chain, "portfolio load started");

        let customized_ids = self.read_preference_list(
            self.store.customized_tokens(&subject.address).await,
            "customized",
        );
        let blocked_ids =
            self.read_preference_list(self.store.blocked_tokens(&subject.address).await, "blocked");

        // Snapshot paint: always published before the live result for this
        // session, by construction.
        match self.store.read_cached_tokens(&subject.address).await {
            Ok(snapshot) if !snapshot.is_empty() => {
                let cached: Vec<TokenItem> = snapshot
                    .into_iter()
                    .filter(|t| t.has_identity() && !blocked_ids.iter().any(|id| t.matches(id)))
                    .collect();
                let count = cached.len();
                let groups = group_by_chain(cached);
                let blocked_for_state = blocked_ids.clone();
                if !self
                    .commit(session, |st| {
                        st.project = st.project.merge(&groups);
                        st.blocked_ids = blocked_for_state;
                    })
                    .await
                {
                    return;
                }
                debug!(tokens = count, "painted cached snapshot");
            }
            Ok(_) => debug!("no cached snapshot"),
            Err(e) => warn!(error = %e, "snapshot cache read failed"),
        }

        // Live aggregation: the eventual authority for this session.
        let live = match self
            .provider
            .fetch_tokens(&subject.address, subject.chain.as_deref())
            .await
        {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "live token query failed; keeping last good state");
                metrics::counter!("portfolio_load_failures_total").increment(1);
                self.commit(session, |st| st.is_loading = false).await;
                return;
            }
        };
        if session.is_cancelled() {
            return;
        }

        let mut classified = classify(&live, &customized_ids, &blocked_ids);
        let (customized_extra, blocked_extra) = tokio::join!(
            self.fetch_zero_balance(&subject.address, &classified.missing_customized),
            self.fetch_zero_balance(&subject.address, &classified.missing_blocked),
        );
        classified.extend_with_zero_balance(customized_extra, blocked_extra);

        let core_by_chain = group_by_chain(std::mem::take(&mut classified.core));
        let committed = self
            .commit(session, move |st| {
                st.project = st.project.merge(&core_by_chain);
                st.customized = classified.customized;
                st.blocked = classified.blocked;
                st.blocked_ids = blocked_ids;
                st.is_loading = false;
            })
            .await;
        if !committed {
            return;
        }
        info!(address = %subject.address, "portfolio load finished");

        // Write-back so the next session for this address paints instantly.
        if let Err(e) = self.store.write_cached_tokens(&subject.address, &live).await {
            warn!(error = %e, "snapshot cache write failed");
        }

        let wants_history = self.state.lock().await.history_at.is_some();
        if wants_history {
            self.run_backfill(session).await;
        }
    }

    fn read_preference_list(
        &self,
        result: anyhow::Result<Vec<TokenId>>,
        kind: &'static str,
    ) -> Vec<TokenId> {
        match result {
            Ok(ids) => ids,
            Err(e) => {
                warn!(kind, error = %e, "preference list read failed; treating as empty");
                Vec::new()
            }
        }
    }

    async fn fetch_zero_balance(&self, address: &str, ids: &[TokenId]) -> Vec<TokenItem> {
        if ids.is_empty() {
            return Vec::new();
        }
        match self.provider.fetch_tokens_by_id(address, ids).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, "zero-balance token lookup failed");
                Vec::new()
            }
        }
    }
}
