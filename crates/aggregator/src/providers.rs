use std::collections::HashMap;
use std::future::Future;

use anyhow::Result;
use common::db::AsyncDb;
use common::openapi::OpenapiClient;
use common::types::{TokenId, TokenItem};
use rust_decimal::Decimal;

/// Live token data from the remote provider.
pub trait TokenQuery {
    fn fetch_tokens(
        &self,
        address: &str,
        chain: Option<&str>,
    ) -> impl Future<Output = Result<Vec<TokenItem>>> + Send;

    fn fetch_tokens_by_id(
        &self,
        address: &str,
        ids: &[TokenId],
    ) -> impl Future<Output = Result<Vec<TokenItem>>> + Send;
}

/// Historical balances and prices from the remote provider.
pub trait HistoryQuery {
    fn fetch_history_tokens(
        &self,
        address: &str,
        time_at: i64,
    ) -> impl Future<Output = Result<Vec<TokenItem>>> + Send;

    fn fetch_history_prices(
        &self,
        chain: &str,
        token_ids: &[String],
        time_at: i64,
    ) -> impl Future<Output = Result<HashMap<String, Decimal>>> + Send;
}

/// Per-address snapshot cache. Reads never fail in an interesting way:
/// an address that was never cached just yields an empty listing.
pub trait SnapshotCache {
    fn read_cached_tokens(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<Vec<TokenItem>>> + Send;

    fn write_cached_tokens(
        &self,
        address: &str,
        tokens: &[TokenItem],
    ) -> impl Future<Output = Result<()>> + Send;
}

/// The externally maintained customized/blocked identity lists.
pub trait PreferenceSource {
    fn customized_tokens(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<Vec<TokenId>>> + Send;

    fn blocked_tokens(&self, address: &str) -> impl Future<Output = Result<Vec<TokenId>>> + Send;
}

impl TokenQuery for OpenapiClient {
    async fn fetch_tokens(&self, address: &str, chain: Option<&str>) -> Result<Vec<TokenItem>> {
        Ok(self.fetch_token_list(address, chain).await?)
    }

    async fn fetch_tokens_by_id(&self, address: &str, ids: &[TokenId]) -> Result<Vec<TokenItem>> {
        Ok(self.fetch_tokens_by_ids(address, ids).await?)
    }
}

impl HistoryQuery for OpenapiClient {
    async fn fetch_history_tokens(&self, address: &str, time_at: i64) -> Result<Vec<TokenItem>> {
        Ok(self.fetch_history_token_list(address, time_at).await?)
    }

    async fn fetch_history_prices(
        &self,
        chain: &str,
        token_ids: &[String],
        time_at: i64,
    ) -> Result<HashMap<String, Decimal>> {
        Ok(self
            .fetch_history_price_list(chain, token_ids, time_at)
            .await?)
    }
}

/// SQLite-backed snapshot cache and preference store.
#[derive(Clone)]
pub struct LocalStore {
    db: AsyncDb,
}

impl LocalStore {
    pub fn new(db: AsyncDb) -> Self {
        Self { db }
    }

    /// Add an identity to the customized list. The pipeline itself only
    /// reads these lists; writes come from the surrounding application.
    pub async fn add_customized(&self, address: &str, id: &TokenId) -> Result<()> {
        self.insert_preference("customized_tokens", address, id).await
    }

    /// Add an identity to the blocked list.
    pub async fn add_blocked(&self, address: &str, id: &TokenId) -> Result<()> {
        self.insert_preference("blocked_tokens", address, id).await
    }

    async fn insert_preference(&self, table: &'static str, address: &str, id: &TokenId) -> Result<()> {
        let account = address.to_ascii_lowercase();
        let chain = id.chain.clone();
        let token_id = id.address.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT OR IGNORE INTO {table} (account, chain, token_id) VALUES (?1, ?2, ?3)"
                    ),
                    rusqlite::params![account, chain, token_id],
                )?;
                Ok(())
            })
            .await
    }

    async fn read_preference(&self, table: &'static str, address: &str) -> Result<Vec<TokenId>> {
        let account = address.to_ascii_lowercase();
        self.db
            .call_named(table, move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT chain, token_id FROM {table} WHERE account = ?1 ORDER BY added_at, token_id"
                ))?;
                let rows = stmt
                    .query_map([account], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows
                    .into_iter()
                    .map(|(chain, token_id)| TokenId::new(&chain, &token_id))
                    .collect())
            })
            .await
    }
}

impl SnapshotCache for LocalStore {
    async fn read_cached_tokens(&self, address: &str) -> Result<Vec<TokenItem>> {
        let account = address.to_ascii_lowercase();
        self.db
            .call_named("token_cache.read", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT chain, token_id, symbol, name, decimals, amount, price, is_core
                     FROM token_cache WHERE account = ?1",
                )?;
                let rows = stmt
                    .query_map([account], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<u32>>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, Option<String>>(6)?,
                            row.get::<_, bool>(7)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows
                    .into_iter()
                    .map(
                        |(chain, token_id, symbol, name, decimals, amount, price, is_core)| {
                            TokenItem {
                                id: token_id,
                                chain,
                                symbol,
                                name,
                                decimals,
                                amount: amount.parse().unwrap_or_default(),
                                price: price.and_then(|p| p.parse().ok()),
                                is_core,
                                history_patched: false,
                            }
                        },
                    )
                    .collect())
            })
            .await
    }

    async fn write_cached_tokens(&self, address: &str, tokens: &[TokenItem]) -> Result<()> {
        let account = address.to_ascii_lowercase();
        let tokens = tokens.to_vec();
        self.db
            .call_named("token_cache.write", move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM token_cache WHERE account = ?1", [&account])?;
                for token in &tokens {
                    tx.execute(
                        "INSERT INTO token_cache
                            (account, chain, token_id, symbol, name, decimals, amount, price, is_core)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                         ON CONFLICT(account, chain, token_id) DO UPDATE SET
                            symbol = excluded.symbol,
                            name = excluded.name,
                            decimals = excluded.decimals,
                            amount = excluded.amount,
                            price = excluded.price,
                            is_core = excluded.is_core,
                            cached_at = datetime('now')",
                        rusqlite::params![
                            account,
                            token.chain,
                            token.id.to_ascii_lowercase(),
                            token.symbol,
                            token.name,
                            token.decimals,
                            token.amount.to_string(),
                            token.price.map(|p| p.to_string()),
                            token.is_core,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }
}

impl PreferenceSource for LocalStore {
    async fn customized_tokens(&self, address: &str) -> Result<Vec<TokenId>> {
        self.read_preference("customized_tokens", address).await
    }

    async fn blocked_tokens(&self, address: &str) -> Result<Vec<TokenId>> {
        self.read_preference("blocked_tokens", address).await
    }
}
