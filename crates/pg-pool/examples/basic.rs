//! Basic pool usage against a stub driver.
//!
//! A real deployment implements [`Manager`] and [`Connection`] over an
//! actual PostgreSQL wire driver. The stub here answers every query with a
//! canned row so the example runs without a server; it exists to show the
//! integration seam and the pool lifecycle.
//!
//! Run with:
//! ```sh
//! cargo run --example basic
//! ```

use std::time::Duration;

use pg_driver_pool::{Connection, Manager, Pool, PoolConfig, ServerConfig};
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
#[error("stub driver error")]
struct StubError;

struct StubConnection;

impl Connection for StubConnection {
    type Error = StubError;
    type Rows = Vec<String>;
    type Param = String;

    async fn establish(&mut self) -> Result<(), StubError> {
        Ok(())
    }

    async fn query(&mut self, text: &str, _params: &[String]) -> Result<Vec<String>, StubError> {
        Ok(vec![format!("echo: {text}")])
    }

    async fn close(&mut self) -> Result<(), StubError> {
        Ok(())
    }

    fn fault_stream(&mut self) -> Option<mpsc::UnboundedReceiver<StubError>> {
        None
    }
}

struct StubManager {
    server: ServerConfig,
}

impl Manager for StubManager {
    type Connection = StubConnection;
    type Error = StubError;

    fn create(&self) -> StubConnection {
        tracing::debug!(server = ?self.server, "creating stub connection");
        StubConnection
    }

    fn is_startup_error(&self, _error: &StubError) -> bool {
        false
    }

    fn is_read_only_error(&self, _error: &StubError) -> bool {
        false
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".into());
    let database = std::env::var("PGDATABASE").unwrap_or_else(|_| "postgres".into());
    let server = ServerConfig::explicit(host, database);
    server.validate()?;

    let config = PoolConfig::new()
        .pool_size(4)
        .idle_timeout(Duration::from_secs(10));
    let pool = Pool::new(config, StubManager { server })?;

    // Watch the pool's lifecycle events while the example runs.
    let mut events = pool.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!(?event, "pool event");
        }
    });

    // One-shot query: acquire, execute, release.
    let rows = pool.query("SELECT now()", &[]).await?;
    println!("rows: {rows:?}");

    // Hold a connection across several statements.
    let mut conn = pool.acquire().await?;
    println!("checked out {}", conn.id());
    let rows = conn.query("SELECT 1", &[]).await?;
    println!("rows: {rows:?}");
    drop(conn); // returned to the pool

    let status = pool.status();
    println!(
        "pool: {}/{} connections, {} idle, {:.0}% utilized",
        status.total,
        status.max,
        status.idle,
        status.utilization()
    );

    pool.end();
    Ok(())
}
