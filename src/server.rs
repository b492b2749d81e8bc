//! Connected servers and the pool that owns them
//!
//! A [`Server`] bundles everything shared by the objects of one management
//! endpoint: the session and event layers, the proxy identity map, the view
//! registry and the task connection tester. Servers are created on demand
//! by [`ServerPool`] and live until closed explicitly.

use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use virtmgmt_core_interface::{Credential, Session, SessionConnector, LOCAL_SERVER};
use virtmgmt_core_resilience::{ConnectionFactory, ConnectionPool, PoolConfig, ResilienceError};

use crate::config::ModelConfig;
use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::job::TaskConnectionTester;
use crate::keys::namespaces;
use crate::locator::ObjectLocator;
use crate::locks;
use crate::repository::ProxyRepository;
use crate::view::ViewFactory;

/// Pool key: server names compare case-insensitively, credentials exactly
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerKey {
    name: String,
    credential: Credential,
}

impl ServerKey {
    pub fn new(name: &str, credential: Credential) -> Self {
        let name = if name.is_empty() { LOCAL_SERVER } else { name };
        Self {
            name: name.to_uppercase(),
            credential,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }
}

pub struct Server {
    credential: Credential,
    ctx: Arc<ServerContext>,
    repository: Arc<ProxyRepository>,
    views: ViewFactory,
    tester: Arc<TaskConnectionTester>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Wrap an open session. Must run inside a tokio runtime; the
    /// repository cleanup task starts here.
    pub fn new(
        session: Arc<dyn Session>,
        credential: Credential,
        config: Arc<ModelConfig>,
        views: ViewFactory,
    ) -> Self {
        let repository = ProxyRepository::new(config.proxy_idle_timeout());
        let cleanup = repository.spawn_cleanup(config.repository_cleanup_interval());
        let tester =
            TaskConnectionTester::new(session.clone(), config.task_connection_check_interval());
        let ctx = ServerContext::new(session, config);
        Self {
            credential,
            ctx,
            repository,
            views,
            tester,
            cleanup: Mutex::new(Some(cleanup)),
        }
    }

    pub fn name(&self) -> &str {
        self.ctx.server_name()
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        self.ctx.session()
    }

    pub fn config(&self) -> &ModelConfig {
        self.ctx.config()
    }

    pub fn repository(&self) -> &Arc<ProxyRepository> {
        &self.repository
    }

    pub fn views(&self) -> &ViewFactory {
        &self.views
    }

    pub fn tester(&self) -> &Arc<TaskConnectionTester> {
        &self.tester
    }

    /// Namespaces the object model works in
    pub fn namespaces(&self) -> &'static [&'static str] {
        &namespaces::ALL
    }

    pub fn locator(self: &Arc<Self>) -> ObjectLocator {
        ObjectLocator::new(self.clone())
    }

    /// Stop background work, drop every event subscription and forget all
    /// proxies
    pub async fn close(&self) {
        if let Some(cleanup) = locks::lock(&self.cleanup).take() {
            cleanup.abort();
        }
        self.ctx.shutdown().await;
        self.repository.clear();
        info!("Closed server {}", self.name());
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name())
            .field("credential", &self.credential)
            .field("proxies", &self.repository.len())
            .finish_non_exhaustive()
    }
}

struct ServerFactory {
    connector: Arc<dyn SessionConnector>,
    config: Arc<ModelConfig>,
    views: ViewFactory,
}

#[async_trait]
impl ConnectionFactory<ServerKey, Server> for ServerFactory {
    async fn create(&self, key: &ServerKey) -> std::result::Result<Server, ResilienceError> {
        debug!("Connecting to {}", key.name);
        let session = self
            .connector
            .connect(&key.name, &key.credential)
            .await
            .map_err(|e| ResilienceError::connect(Error::from_session(&key.name, e, false)))?;
        info!("Connected to {}", session.server_name());
        Ok(Server::new(
            session,
            key.credential.clone(),
            self.config.clone(),
            self.views.clone(),
        ))
    }

    async fn close(&self, server: Arc<Server>) {
        server.close().await;
    }
}

/// One [`Server`] per (name, credential)
pub struct ServerPool {
    pool: ConnectionPool<ServerKey, Server>,
    config: Arc<ModelConfig>,
}

impl ServerPool {
    pub fn new(connector: Arc<dyn SessionConnector>, config: Arc<ModelConfig>) -> Self {
        Self::with_views(connector, config, ViewFactory::with_defaults())
    }

    /// Pool whose servers resolve views through `views`
    pub fn with_views(
        connector: Arc<dyn SessionConnector>,
        config: Arc<ModelConfig>,
        views: ViewFactory,
    ) -> Self {
        let factory = Arc::new(ServerFactory {
            connector,
            config: config.clone(),
            views,
        });
        Self {
            pool: ConnectionPool::new(factory, PoolConfig::default()),
            config,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Reuse the open server for `name` and `credential` or connect a new one
    pub async fn get_server(&self, name: &str, credential: &Credential) -> Result<Arc<Server>> {
        let key = ServerKey::new(name, credential.clone());
        self.pool.acquire(&key).await.map_err(|e| match e.connect_source::<Error>() {
            Some(err) => err.clone(),
            None => Error::Resilience(e),
        })
    }

    /// Close one server. Returns false if it was not open.
    pub async fn close(&self, name: &str, credential: &Credential) -> bool {
        self.pool.close(&ServerKey::new(name, credential.clone())).await
    }

    pub async fn close_all(&self) {
        self.pool.close_all().await;
    }

    pub async fn servers(&self) -> Vec<ServerKey> {
        self.pool.keys().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectionIssue;
    use crate::session::mock::MockSession;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use virtmgmt_core_interface::{hresult, SessionError};

    struct MockConnector {
        connects: AtomicUsize,
        reachable: bool,
    }

    #[async_trait]
    impl SessionConnector for MockConnector {
        async fn connect(
            &self,
            server: &str,
            _credential: &Credential,
        ) -> virtmgmt_core_interface::Result<Arc<dyn Session>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if !self.reachable {
                return Err(SessionError::transport(hresult::RPC_S_SERVER_UNAVAILABLE, "no route"));
            }
            Ok(Arc::new(MockSession::new(server)))
        }
    }

    fn pool(reachable: bool) -> (Arc<MockConnector>, ServerPool) {
        let connector = Arc::new(MockConnector {
            connects: AtomicUsize::new(0),
            reachable,
        });
        let pool = ServerPool::new(connector.clone(), Arc::new(ModelConfig::default()));
        (connector, pool)
    }

    #[tokio::test]
    async fn test_same_server_any_case_is_shared() {
        let (connector, pool) = pool(true);
        let a = pool.get_server("host01", &Credential::Current).await.unwrap();
        let b = pool.get_server("HOST01", &Credential::Current).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(a.namespaces().len(), 4);
    }

    #[tokio::test]
    async fn test_credentials_get_separate_servers() {
        let (connector, pool) = pool(true);
        let admin = Credential::Explicit {
            user: "admin".into(),
            domain: Some("CORP".into()),
        };
        let a = pool.get_server("HOST01", &Credential::Current).await.unwrap();
        let b = pool.get_server("HOST01", &admin).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.servers().await.len(), 2);
    }

    #[tokio::test]
    async fn test_close_reconnects_next_time() {
        let (connector, pool) = pool(true);
        pool.get_server("HOST01", &Credential::Current).await.unwrap();
        assert!(pool.close("host01", &Credential::Current).await);
        assert!(!pool.close("host01", &Credential::Current).await);
        pool.get_server("HOST01", &Credential::Current).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        pool.close_all().await;
        assert!(pool.servers().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_keeps_classification() {
        let (_, pool) = pool(false);
        let err = pool.get_server("HOST01", &Credential::Current).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ConnectionIssue {
                issue: ConnectionIssue::RpcServerUnavailable,
                ..
            }
        ));
        assert!(err.is_transient());
    }
}
