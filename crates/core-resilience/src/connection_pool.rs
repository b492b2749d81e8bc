//! Keyed connection pool
//!
//! Holds at most one shared connection per key. A connection is created on
//! first use, handed out as an `Arc` to every later caller with an equal key,
//! and replaced when the factory reports it unhealthy. Teardown is explicit:
//! callers close one key or the whole pool.

use super::error::ResilienceError;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of distinct keys held open
    pub max_size: usize,
    /// Timeout for creating a new connection
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 64,
            connect_timeout: Duration::from_secs(60),
        }
    }
}

/// Factory trait for creating and validating connections
#[async_trait::async_trait]
pub trait ConnectionFactory<K, T>: Send + Sync
where
    K: Send + Sync,
    T: Send + Sync + 'static,
{
    /// Create a new connection for `key`
    async fn create(&self, key: &K) -> Result<T, ResilienceError>;

    /// Check if a pooled connection can still be handed out
    async fn is_healthy(&self, _conn: &T) -> bool {
        true
    }

    /// Close a connection (optional cleanup)
    async fn close(&self, conn: Arc<T>) {
        drop(conn);
    }
}

/// A keyed pool of shared connections
///
/// # Example
/// ```no_run
/// use virtmgmt_core_resilience::{ConnectionFactory, ConnectionPool, PoolConfig, ResilienceError};
/// use std::sync::Arc;
///
/// struct Endpoint { name: String }
/// struct EndpointFactory;
///
/// #[async_trait::async_trait]
/// impl ConnectionFactory<String, Endpoint> for EndpointFactory {
///     async fn create(&self, key: &String) -> Result<Endpoint, ResilienceError> {
///         Ok(Endpoint { name: key.clone() })
///     }
/// }
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pool = ConnectionPool::new(Arc::new(EndpointFactory), PoolConfig::default());
/// let a = pool.acquire(&"HOST01".to_string()).await?;
/// let b = pool.acquire(&"HOST01".to_string()).await?;
/// assert!(Arc::ptr_eq(&a, &b));
/// pool.close_all().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<K, T>
where
    K: Send + Sync,
    T: Send + Sync + 'static,
{
    config: Arc<PoolConfig>,
    factory: Arc<dyn ConnectionFactory<K, T>>,
    state: Arc<Mutex<PoolState<K, T>>>,
}

struct PoolState<K, T> {
    open: HashMap<K, Arc<T>>,
}

impl<K, T> ConnectionPool<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    pub fn new(factory: Arc<dyn ConnectionFactory<K, T>>, config: PoolConfig) -> Self {
        Self {
            config: Arc::new(config),
            factory,
            state: Arc::new(Mutex::new(PoolState {
                open: HashMap::new(),
            })),
        }
    }

    /// Get the connection for `key`, creating it if needed.
    ///
    /// The pool lock is held across creation so concurrent callers with the
    /// same key never open two connections.
    pub async fn acquire(&self, key: &K) -> Result<Arc<T>, ResilienceError> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.open.get(key).cloned() {
            if self.factory.is_healthy(&existing).await {
                return Ok(existing);
            }
            tracing::debug!("Replacing unhealthy connection for {:?}", key);
            state.open.remove(key);
            self.factory.close(existing).await;
        }

        if state.open.len() >= self.config.max_size {
            return Err(ResilienceError::PoolExhausted(self.config.max_size));
        }

        let conn = tokio::time::timeout(self.config.connect_timeout, self.factory.create(key))
            .await
            .map_err(|_| ResilienceError::Timeout(self.config.connect_timeout))??;

        let conn = Arc::new(conn);
        state.open.insert(key.clone(), conn.clone());
        Ok(conn)
    }

    /// Connection for `key` if one is open, without creating one
    pub async fn get(&self, key: &K) -> Option<Arc<T>> {
        self.state.lock().await.open.get(key).cloned()
    }

    /// Close the connection for `key`. Returns false if none was open.
    pub async fn close(&self, key: &K) -> bool {
        let removed = self.state.lock().await.open.remove(key);

        match removed {
            Some(conn) => {
                self.factory.close(conn).await;
                true
            }
            None => false,
        }
    }

    /// Close every open connection
    pub async fn close_all(&self) {
        let drained: Vec<Arc<T>> = {
            let mut state = self.state.lock().await;
            state.open.drain().map(|(_, conn)| conn).collect()
        };

        for conn in drained {
            self.factory.close(conn).await;
        }
    }

    pub async fn keys(&self) -> Vec<K> {
        self.state.lock().await.open.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct TestConnection {
        id: usize,
        healthy: AtomicBool,
    }

    struct TestFactory {
        counter: AtomicUsize,
        closed: AtomicUsize,
    }

    impl TestFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                counter: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl ConnectionFactory<String, TestConnection> for TestFactory {
        async fn create(&self, key: &String) -> Result<TestConnection, ResilienceError> {
            if key == "unreachable" {
                return Err(ResilienceError::Transient("no route".into()));
            }
            let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TestConnection {
                id,
                healthy: AtomicBool::new(true),
            })
        }

        async fn is_healthy(&self, conn: &TestConnection) -> bool {
            conn.healthy.load(Ordering::SeqCst)
        }

        async fn close(&self, _conn: Arc<TestConnection>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_same_key_shares_connection() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(factory.clone(), PoolConfig::default());

        let a = pool.acquire(&"h1".to_string()).await.unwrap();
        let b = pool.acquire(&"h1".to_string()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = pool.acquire(&"h2".to_string()).await.unwrap();
        assert_ne!(a.id, c.id);

        assert_eq!(pool.keys().await.len(), 2);
        assert_eq!(factory.counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unhealthy_connection_replaced() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(factory.clone(), PoolConfig::default());

        let first = pool.acquire(&"h".to_string()).await.unwrap();
        first.healthy.store(false, Ordering::SeqCst);

        let second = pool.acquire(&"h".to_string()).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_and_close_all() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(factory.clone(), PoolConfig::default());

        pool.acquire(&"a".to_string()).await.unwrap();
        pool.acquire(&"b".to_string()).await.unwrap();
        pool.acquire(&"c".to_string()).await.unwrap();

        assert!(pool.close(&"a".to_string()).await);
        assert!(!pool.close(&"a".to_string()).await);
        assert!(pool.get(&"a".to_string()).await.is_none());

        pool.close_all().await;
        assert!(pool.keys().await.is_empty());
        assert_eq!(factory.closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_create_failure_not_cached() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(factory, PoolConfig::default());

        let result = pool.acquire(&"unreachable".to_string()).await;
        assert!(matches!(result, Err(ResilienceError::Transient(_))));
        assert!(pool.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_max_size() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(
            factory,
            PoolConfig {
                max_size: 1,
                ..Default::default()
            },
        );

        pool.acquire(&"a".to_string()).await.unwrap();
        let result = pool.acquire(&"b".to_string()).await;
        assert!(matches!(result, Err(ResilienceError::PoolExhausted(1))));
        assert!(pool.acquire(&"a".to_string()).await.is_ok());
    }
}
