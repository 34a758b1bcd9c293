//! Process-wide pool of event hub clients.
//!
//! One connection per connection string per worker: readers borrow on
//! construction, return on teardown, and the connection is torn down when the
//! last borrower returns it. On fatal transport failures the cache
//! force-closes the pooled connection so the next borrow rebuilds it. The
//! pool mutex is only ever held across map operations, never across I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::evstream::client::{create_client, EventHubClient};
use crate::evstream::conf::EventHubsConf;
use crate::evstream::error::Result;

struct PooledClient {
    client: Arc<dyn EventHubClient>,
    borrows: usize,
}

static POOL: OnceLock<Mutex<HashMap<String, PooledClient>>> = OnceLock::new();

fn pool() -> &'static Mutex<HashMap<String, PooledClient>> {
    POOL.get_or_init(|| Mutex::new(HashMap::new()))
}

pub struct ClientConnectionPool;

impl ClientConnectionPool {
    fn key(conf: &EventHubsConf) -> String {
        conf.connection_string().to_lowercase()
    }

    /// Borrow the pooled client for `conf`, creating it on first use.
    /// Repeated borrows hand out the same underlying connection.
    pub async fn borrow(conf: &EventHubsConf) -> Result<Arc<dyn EventHubClient>> {
        let key = Self::key(conf);
        if let Some(entry) = pool().lock().unwrap().get_mut(&key) {
            entry.borrows += 1;
            return Ok(entry.client.clone());
        }

        let created = create_client(conf).await?;
        let mut extra = None;
        let client = {
            let mut guard = pool().lock().unwrap();
            match guard.get_mut(&key) {
                // Someone else connected while we were; keep theirs.
                Some(entry) => {
                    entry.borrows += 1;
                    extra = Some(created);
                    entry.client.clone()
                }
                None => {
                    guard.insert(
                        key,
                        PooledClient {
                            client: created.clone(),
                            borrows: 1,
                        },
                    );
                    created
                }
            }
        };
        if let Some(duplicate) = extra {
            tokio::spawn(async move {
                let _ = duplicate.close().await;
            });
        }
        Ok(client)
    }

    /// Return a borrowed client. The connection is closed once the last
    /// borrower has returned it.
    pub async fn return_client(conf: &EventHubsConf) {
        let key = Self::key(conf);
        let to_close = {
            let mut guard = pool().lock().unwrap();
            let last_borrow = match guard.get_mut(&key) {
                Some(entry) => {
                    entry.borrows = entry.borrows.saturating_sub(1);
                    entry.borrows == 0
                }
                None => false,
            };
            if last_borrow {
                guard.remove(&key).map(|e| e.client)
            } else {
                None
            }
        };
        if let Some(client) = to_close {
            if let Err(err) = client.close().await {
                log::warn!("closing a pooled event hub client failed: {}", err);
            }
        }
    }

    /// Drop the pooled connection regardless of outstanding borrows. Used
    /// when the transport is known dead; the next borrow reconnects.
    pub async fn force_close(conf: &EventHubsConf) {
        let key = Self::key(conf);
        let removed = pool().lock().unwrap().remove(&key).map(|e| e.client);
        if let Some(client) = removed {
            log::warn!("force-closing the pooled event hub client for a rebuild");
            if let Err(err) = client.close().await {
                log::warn!("force-close of a pooled client failed: {}", err);
            }
        }
    }
}
