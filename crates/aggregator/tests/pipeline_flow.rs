//! End-to-end pipeline tests against a scripted provider and an in-memory
//! store: snapshot paint, live supersede, classification, cancellation and
//! history backfill.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use common::db::AsyncDb;
use common::types::{TokenId, TokenItem};
use rust_decimal::Decimal;
use tokio::sync::Notify;

use aggregator::providers::{HistoryQuery, SnapshotCache, TokenQuery};
use aggregator::{LocalStore, PortfolioService};

#[derive(Default)]
struct FakeProvider {
    live: Mutex<Vec<TokenItem>>,
    by_id: Mutex<Vec<TokenItem>>,
    history_tokens: Mutex<Vec<TokenItem>>,
    history_prices: Mutex<HashMap<String, HashMap<String, Decimal>>>,
    fail_live: AtomicBool,
    live_gate: Mutex<Option<Arc<Notify>>>,
}

impl TokenQuery for FakeProvider {
    async fn fetch_tokens(&self, _address: &str, chain: Option<&str>) -> Result<Vec<TokenItem>> {
        let gate = self.live_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_live.load(Ordering::SeqCst) {
            anyhow::bail!("provider down");
        }
        let tokens = self.live.lock().unwrap().clone();
        Ok(match chain {
            Some(chain) => tokens.into_iter().filter(|t| t.chain == chain).collect(),
            None => tokens,
        })
    }

    async fn fetch_tokens_by_id(&self, _address: &str, ids: &[TokenId]) -> Result<Vec<TokenItem>> {
        let all = self.by_id.lock().unwrap().clone();
        Ok(all
            .into_iter()
            .filter(|t| ids.iter().any(|id| t.matches(id)))
            .collect())
    }
}

impl HistoryQuery for FakeProvider {
    async fn fetch_history_tokens(&self, _address: &str, _time_at: i64) -> Result<Vec<TokenItem>> {
        Ok(self.history_tokens.lock().unwrap().clone())
    }

    async fn fetch_history_prices(
        &self,
        chain: &str,
        _token_ids: &[String],
        _time_at: i64,
    ) -> Result<HashMap<String, Decimal>> {
        self.history_prices
            .lock()
            .unwrap()
            .get(chain)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no historical prices for {chain}"))
    }
}

fn token(chain: &str, id: &str, amount: i64, price: i64, is_core: bool) -> TokenItem {
    TokenItem {
        id: id.to_string(),
        chain: chain.to_string(),
        symbol: Some(id.trim_start_matches("0x").to_ascii_uppercase()),
        amount: Decimal::from(amount),
        price: Some(Decimal::from(price)),
        is_core,
        ..TokenItem::default()
    }
}

async fn store() -> Arc<LocalStore> {
    Arc::new(LocalStore::new(AsyncDb::open(":memory:").await.unwrap()))
}

#[tokio::test]
async fn test_live_load_computes_net_worth() {
    let provider = Arc::new(FakeProvider::default());
    *provider.live.lock().unwrap() = vec![token("eth", "0xa", 2, 10, true)];

    let service = PortfolioService::new(provider, store().await);
    let view_rx = service.subscribe();

    service.set_subject("0xUser", None).await;

    let view = view_rx.borrow().clone();
    assert_eq!(view.net_worth, Decimal::from(20));
    assert_eq!(view.net_worth_change, None);
    assert!(!view.is_loading);
    assert!(view.has_any_portfolio);
    assert_eq!(view.core_tokens.len(), 1);
}

#[tokio::test]
async fn test_live_result_supersedes_snapshot_and_writes_back() {
    let provider = Arc::new(FakeProvider::default());
    *provider.live.lock().unwrap() = vec![token("eth", "0xa", 2, 10, true)];

    let store = store().await;
    store
        .write_cached_tokens("0xuser", &[token("eth", "0xa", 1, 10, true)])
        .await
        .unwrap();

    let service = PortfolioService::new(provider, store.clone());
    let view_rx = service.subscribe();
    service.set_subject("0xuser", None).await;

    let view = view_rx.borrow().clone();
    assert_eq!(view.net_worth, Decimal::from(20));

    let cached = store.read_cached_tokens("0xuser").await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].amount, Decimal::from(2));
}

#[tokio::test]
async fn test_failed_live_fetch_retains_snapshot_state() {
    let provider = Arc::new(FakeProvider::default());
    provider.fail_live.store(true, Ordering::SeqCst);

    let store = store().await;
    store
        .write_cached_tokens("0xuser", &[token("eth", "0xa", 1, 10, true)])
        .await
        .unwrap();

    let service = PortfolioService::new(provider, store);
    let view_rx = service.subscribe();
    service.set_subject("0xuser", None).await;

    let view = view_rx.borrow().clone();
    // The snapshot paint survives; the session is simply marked not-loading.
    assert_eq!(view.net_worth, Decimal::from(10));
    assert!(!view.is_loading);
    assert_eq!(view.core_tokens.len(), 1);
}

#[tokio::test]
async fn test_blocked_tokens_are_excluded_from_net_worth() {
    let provider = Arc::new(FakeProvider::default());
    *provider.live.lock().unwrap() = vec![
        token("eth", "0xa", 2, 10, true),
        token("eth", "0xbad", 5, 2, true),
    ];

    let store = store().await;
    store
        .add_blocked("0xuser", &TokenId::new("eth", "0xBAD"))
        .await
        .unwrap();

    let service = PortfolioService::new(provider, store);
    let view_rx = service.subscribe();
    service.set_subject("0xuser", None).await;

    let view = view_rx.borrow().clone();
    assert_eq!(view.net_worth, Decimal::from(20));
    assert!(view.core_tokens.iter().all(|t| t.id != "0xbad"));
    assert_eq!(view.blocked_tokens.len(), 1);
    assert_eq!(view.blocked_tokens[0].id, "0xbad");
}

#[tokio::test]
async fn test_zero_balance_customized_token_is_looked_up() {
    let provider = Arc::new(FakeProvider::default());
    *provider.live.lock().unwrap() = vec![token("eth", "0xa", 2, 10, true)];
    *provider.by_id.lock().unwrap() = vec![token("bsc", "0xb", 0, 1, false)];

    let store = store().await;
    store
        .add_customized("0xuser", &TokenId::new("bsc", "0xB"))
        .await
        .unwrap();

    let service = PortfolioService::new(provider, store);
    let view_rx = service.subscribe();
    service.set_subject("0xuser", None).await;

    let view = view_rx.borrow().clone();
    // Absent from the live query, present in the customized output set.
    assert_eq!(view.customized_tokens.len(), 1);
    assert_eq!(view.customized_tokens[0].id, "0xb");
    // Zero balance: contributes nothing to net worth.
    assert_eq!(view.net_worth, Decimal::from(20));
}

#[tokio::test]
async fn test_cancel_before_live_resolves_keeps_snapshot_untouched() {
    let provider = Arc::new(FakeProvider::default());
    *provider.live.lock().unwrap() = vec![token("eth", "0xa", 99, 10, true)];
    let gate = Arc::new(Notify::new());
    *provider.live_gate.lock().unwrap() = Some(gate.clone());

    let store = store().await;
    store
        .write_cached_tokens("0xuser", &[token("eth", "0xa", 1, 10, true)])
        .await
        .unwrap();

    let service = Arc::new(PortfolioService::new(provider, store));
    let mut view_rx = service.subscribe();

    let loader = {
        let service = service.clone();
        tokio::spawn(async move { service.set_subject("0xuser", None).await })
    };

    // Wait for the snapshot paint to land.
    while view_rx.borrow().core_tokens.is_empty() {
        view_rx.changed().await.unwrap();
    }

    // Cancel while the live fetch is still pending, then release it.
    service.teardown().await;
    gate.notify_one();
    loader.await.unwrap();

    let view = view_rx.borrow().clone();
    assert_eq!(view.net_worth, Decimal::from(10));
    assert_eq!(view.core_tokens[0].amount, Decimal::from(1));
}

#[tokio::test]
async fn test_new_subject_supersedes_inflight_load() {
    let provider = Arc::new(FakeProvider::default());
    *provider.live.lock().unwrap() = vec![token("eth", "0xa", 2, 10, true)];
    let gate = Arc::new(Notify::new());
    *provider.live_gate.lock().unwrap() = Some(gate.clone());

    let service = Arc::new(PortfolioService::new(provider.clone(), store().await));

    let first = {
        let service = service.clone();
        tokio::spawn(async move { service.set_subject("0xfirst", None).await })
    };
    // Let the first load reach its gated live fetch before switching.
    tokio::task::yield_now().await;

    // New subject: opens the gate for both fetches and supersedes the first
    // session before it can publish.
    *provider.live_gate.lock().unwrap() = None;
    gate.notify_one();
    service.set_subject("0xsecond", None).await;
    first.await.unwrap();

    let view = service.subscribe().borrow().clone();
    assert_eq!(view.net_worth, Decimal::from(20));
    assert!(!view.is_loading);
}

#[tokio::test]
async fn test_backfill_patches_only_chains_with_prices() {
    let provider = Arc::new(FakeProvider::default());
    *provider.live.lock().unwrap() = vec![
        token("eth", "0xa", 2, 10, true),
        token("bsc", "0xb", 5, 3, true),
    ];
    provider.history_prices.lock().unwrap().insert(
        "eth".to_string(),
        HashMap::from([("0xa".to_string(), Decimal::from(6))]),
    );
    // No entry for "bsc": its historical prices never arrive.

    let service = PortfolioService::new(provider, store().await);
    let view_rx = service.subscribe();

    service.set_history_at(Some(1_700_000_000)).await;
    service.set_subject("0xuser", None).await;

    let view = view_rx.borrow().clone();
    // Only eth's delta counts: 2 x (10 - 6). bsc stays absent from the sum.
    assert_eq!(view.net_worth_change, Some(Decimal::from(8)));
    assert_eq!(view.net_worth, Decimal::from(35));

    // A second backfill trigger for the same session is a no-op.
    service.set_history_at(Some(1_700_000_000)).await;
    let view = view_rx.borrow().clone();
    assert_eq!(view.net_worth_change, Some(Decimal::from(8)));
}

#[tokio::test]
async fn test_backfill_uses_historical_balances_when_present() {
    let provider = Arc::new(FakeProvider::default());
    *provider.live.lock().unwrap() = vec![token("eth", "0xa", 2, 10, true)];
    // Held 1 x $4 at the historical timestamp.
    *provider.history_tokens.lock().unwrap() = vec![token("eth", "0xa", 1, 4, true)];

    let service = PortfolioService::new(provider, store().await);
    let view_rx = service.subscribe();

    service.set_history_at(Some(1_700_000_000)).await;
    service.set_subject("0xuser", None).await;

    let view = view_rx.borrow().clone();
    assert_eq!(view.net_worth_change, Some(Decimal::from(16)));
    assert_eq!(view.net_worth, Decimal::from(20));
}

#[tokio::test]
async fn test_no_backfill_without_timestamp() {
    let provider = Arc::new(FakeProvider::default());
    *provider.live.lock().unwrap() = vec![token("eth", "0xa", 2, 10, true)];
    provider.history_prices.lock().unwrap().insert(
        "eth".to_string(),
        HashMap::from([("0xa".to_string(), Decimal::from(6))]),
    );

    let service = PortfolioService::new(provider, store().await);
    let view_rx = service.subscribe();
    service.set_subject("0xuser", None).await;

    assert_eq!(view_rx.borrow().net_worth_change, None);
}

#[tokio::test]
async fn test_no_backfill_for_zero_net_worth() {
    let provider = Arc::new(FakeProvider::default());

    let service = PortfolioService::new(provider, store().await);
    let view_rx = service.subscribe();

    service.set_history_at(Some(1_700_000_000)).await;
    service.set_subject("0xuser", None).await;

    let view = view_rx.borrow().clone();
    assert_eq!(view.net_worth, Decimal::ZERO);
    assert_eq!(view.net_worth_change, None);
}

#[tokio::test]
async fn test_refresh_reruns_load_and_allows_new_backfill() {
    let provider = Arc::new(FakeProvider::default());
    *provider.live.lock().unwrap() = vec![token("eth", "0xa", 2, 10, true)];
    provider.history_prices.lock().unwrap().insert(
        "eth".to_string(),
        HashMap::from([("0xa".to_string(), Decimal::from(6))]),
    );

    let service = PortfolioService::new(provider.clone(), store().await);
    let view_rx = service.subscribe();

    service.set_history_at(Some(1_700_000_000)).await;
    service.set_subject("0xuser", None).await;
    assert_eq!(view_rx.borrow().net_worth_change, Some(Decimal::from(8)));

    // Refresh opens a new session: fresh project, fresh backfill.
    *provider.live.lock().unwrap() = vec![token("eth", "0xa", 3, 10, true)];
    service.refresh().await;

    let view = view_rx.borrow().clone();
    assert_eq!(view.net_worth, Decimal::from(30));
    // 3 x (10 - 6), applied once to the fresh project.
    assert_eq!(view.net_worth_change, Some(Decimal::from(12)));
}

#[tokio::test]
async fn test_set_same_subject_is_a_noop() {
    let provider = Arc::new(FakeProvider::default());
    *provider.live.lock().unwrap() = vec![token("eth", "0xa", 2, 10, true)];

    let service = PortfolioService::new(provider.clone(), store().await);
    let view_rx = service.subscribe();
    service.set_subject("0xUser", None).await;

    *provider.live.lock().unwrap() = vec![token("eth", "0xa", 9, 10, true)];
    // Same address (case-insensitive): no reload.
    service.set_subject("0xuser", None).await;

    assert_eq!(view_rx.borrow().net_worth, Decimal::from(20));
}

#[tokio::test]
async fn test_chain_filter_scopes_live_query() {
    let provider = Arc::new(FakeProvider::default());
    *provider.live.lock().unwrap() = vec![
        token("eth", "0xa", 2, 10, true),
        token("bsc", "0xb", 5, 3, true),
    ];

    let service = PortfolioService::new(provider, store().await);
    let view_rx = service.subscribe();
    service.set_subject("0xuser", Some("bsc")).await;

    let view = view_rx.borrow().clone();
    assert_eq!(view.net_worth, Decimal::from(15));
    assert!(view.core_tokens.iter().all(|t| t.chain == "bsc"));
}
