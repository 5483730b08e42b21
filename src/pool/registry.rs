//! Registry of pools by key.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::cancel::Scope;
use crate::pool::conn_pool::ConnPool;
use crate::pool::key::PoolKey;
use crate::transport::Pipeline;

pub(crate) struct PoolRegistry {
    pools: DashMap<PoolKey, Arc<ConnPool>>,
    root: Scope,
}

impl PoolRegistry {
    pub(crate) fn new(root: Scope) -> Arc<Self> {
        Arc::new(Self {
            pools: DashMap::new(),
            root,
        })
    }

    /// The live pool for `key`, if any.
    pub(crate) fn get(&self, key: &PoolKey) -> Option<Arc<ConnPool>> {
        self.pools
            .get(key)
            .map(|p| p.value().clone())
            .filter(|p| p.is_alive())
    }

    /// Give `pipeline` to the pool for `key`, creating the pool if needed.
    /// Returns `false` (after closing the connection) once the registry has
    /// been shut down.
    pub(crate) fn attach(self: &Arc<Self>, key: PoolKey, pipeline: Pipeline) -> bool {
        if self.root.is_cancelled() {
            pipeline.close();
            return false;
        }
        // The entry guard makes "is this pool still alive" and the slot
        // reservation one step, so a pool that just emptied is replaced
        // rather than revived.
        let pool = match self.pools.entry(key) {
            Entry::Occupied(mut e) => {
                if e.get().try_acquire() {
                    e.get().clone()
                } else {
                    let pool = ConnPool::new(e.key().clone(), &self.root, Arc::downgrade(self));
                    pool.acquire_first();
                    e.insert(pool.clone());
                    pool
                }
            }
            Entry::Vacant(v) => {
                let pool = ConnPool::new(v.key().clone(), &self.root, Arc::downgrade(self));
                pool.acquire_first();
                v.insert(pool.clone());
                pool
            }
        };
        pool.spawn_worker(pipeline);
        true
    }

    /// Drop `pool` from the registry unless it has been replaced already.
    pub(crate) fn remove_pool(&self, pool: &ConnPool) {
        self.pools
            .remove_if(pool.key(), |_, current| std::ptr::eq(Arc::as_ptr(current), pool));
    }

    pub(crate) fn len(&self) -> usize {
        self.pools.len()
    }

    /// Let every pool finish its running requests, then close.
    pub(crate) fn close(&self) {
        for pool in self.take_all() {
            pool.close();
        }
    }

    /// Close every pooled connection now.
    pub(crate) fn force_close(&self) {
        for pool in self.take_all() {
            pool.force_close();
        }
    }

    fn take_all(&self) -> Vec<Arc<ConnPool>> {
        let pools: Vec<Arc<ConnPool>> = self.pools.iter().map(|e| e.value().clone()).collect();
        for pool in &pools {
            self.remove_pool(pool);
        }
        pools
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::connector::MaybeTlsStream;
    use crate::transport::h1::Http1Conn;
    use crate::transport::resolve::{Scheme, Target};
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    fn key(host: &str) -> PoolKey {
        let target = Target {
            scheme: Scheme::Http,
            host: host.into(),
            port: 80,
        };
        PoolKey::new(&[], &target, false, false)
    }

    fn pipeline(root: &Scope) -> (Pipeline, DuplexStream) {
        let (client, server) = duplex(1024);
        let conn = Http1Conn::new(MaybeTlsStream::Plain(Box::new(client)), root);
        conn.state().set_reusable(true);
        (Pipeline::Http1(conn), server)
    }

    #[tokio::test]
    async fn test_attach_creates_and_shares_pool() {
        let root = Scope::new();
        let registry = PoolRegistry::new(root.clone());
        let (a, _sa) = pipeline(&root);
        let (b, _sb) = pipeline(&root);
        assert!(registry.attach(key("a.local"), a));
        assert!(registry.attach(key("a.local"), b));
        assert_eq!(registry.len(), 1);
        let pool = registry.get(&key("a.local")).unwrap();
        assert_eq!(pool.total(), 2);
        assert!(registry.get(&key("b.local")).is_none());
    }

    #[tokio::test]
    async fn test_last_connection_leaving_removes_pool() {
        let root = Scope::new();
        let registry = PoolRegistry::new(root.clone());
        let (p, server) = pipeline(&root);
        assert!(registry.attach(key("a.local"), p));
        drop(server);
        for _ in 0..100 {
            if registry.len() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(registry.len(), 0);
        assert!(registry.get(&key("a.local")).is_none());
    }

    #[tokio::test]
    async fn test_attach_after_shutdown_closes_connection() {
        let root = Scope::new();
        let registry = PoolRegistry::new(root.clone());
        registry.close();
        root.cancel();
        let (p, _server) = pipeline(&Scope::new());
        let state = p.state().clone();
        assert!(!registry.attach(key("a.local"), p));
        assert!(state.force.is_cancelled());
    }

    #[tokio::test]
    async fn test_force_close_tears_down_connections() {
        let root = Scope::new();
        let registry = PoolRegistry::new(root.clone());
        let (p, _server) = pipeline(&root);
        let state = p.state().clone();
        assert!(registry.attach(key("a.local"), p));
        registry.force_close();
        assert_eq!(registry.len(), 0);
        tokio::time::timeout(Duration::from_secs(2), state.force.cancelled())
            .await
            .unwrap();
    }
}
