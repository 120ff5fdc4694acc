use std::sync::Arc;

use anyhow::Result;

use aggregator::{cli, metrics, LocalStore, PortfolioService, PortfolioView};

#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load()?;

    let dispatch = common::observability::build_dispatch(&config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    match cmd {
        cli::Command::Cached { address } => {
            // Read-only listing; sync database is enough for a command that
            // exits immediately.
            let db = common::db::Database::open(&config.database.path)?;
            db.run_migrations()?;
            show_cached(&db, &address)
        }
        cli::Command::View {
            address,
            chain,
            since,
        } => {
            metrics::install_prometheus(config.observability.prometheus_port)?;
            metrics::describe();

            let db = common::db::AsyncDb::open(&config.database.path).await?;
            let store = Arc::new(LocalStore::new(db));
            let client = Arc::new(common::openapi::OpenapiClient::new_with_settings(
                &config.provider.api_url,
                std::time::Duration::from_secs(config.provider.request_timeout_secs),
                std::time::Duration::from_millis(config.provider.rate_limit_delay_ms),
                config.provider.max_retries,
                std::time::Duration::from_millis(config.provider.backoff_base_ms),
            ));

            let service = PortfolioService::new(client, store);
            let view_rx = service.subscribe();

            service.set_history_at(since).await;
            service.set_subject(&address, chain.as_deref()).await;

            let view = view_rx.borrow().clone();
            print_view(&address, &view);
            service.teardown().await;
            Ok(())
        }
    }
}

fn show_cached(db: &common::db::Database, address: &str) -> Result<()> {
    let account = address.to_ascii_lowercase();
    let mut stmt = db.conn.prepare(
        "SELECT chain, token_id, symbol, amount, price, cached_at
         FROM token_cache WHERE account = ?1 ORDER BY chain, token_id",
    )?;
    let rows = stmt.query_map([&account], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;

    println!("Cached tokens for {address}:");
    let mut count = 0;
    for row in rows {
        let (chain, token_id, symbol, amount, price, cached_at) = row?;
        println!(
            "  {chain:>8}  {sym:<8} amount={amount} price={price}  cached_at={cached_at}  {token_id}",
            sym = symbol.as_deref().unwrap_or("?"),
            price = price.as_deref().unwrap_or("-"),
        );
        count += 1;
    }
    if count == 0 {
        println!("  (nothing cached)");
    }
    Ok(())
}

fn print_view(address: &str, view: &PortfolioView) {
    println!("Portfolio for {address}:");
    println!("  net worth:  {}", view.display_net_worth());
    println!(
        "  change:     {} {}",
        view.display_net_worth_change(),
        view.display_change_percent()
    );
    println!(
        "  tokens: {} core, {} customized, {} blocked",
        view.core_tokens.len(),
        view.customized_tokens.len(),
        view.blocked_tokens.len()
    );
    for token in view.core_tokens.iter().take(20) {
        println!(
            "  {chain:>8}  {sym:<8} amount={amount} value=${value:.2}",
            chain = token.chain,
            sym = token.symbol.as_deref().unwrap_or("?"),
            amount = token.amount,
            value = token.usd_value(),
        );
    }
}
