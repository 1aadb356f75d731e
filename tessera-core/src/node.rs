use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::backend::Backend;
use crate::cache::CacheTier;
use crate::dispatch::CommandRouter;
use crate::error::Result;
use crate::id::GroupId;
use crate::notify::NotifyRegistry;
use crate::routing::{NodeAddr, RouteEntry, RouteGraph};
use crate::transport::{FrameTransport, TransactionPool};
use crate::wire::Frame;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub addr: NodeAddr,
    pub group: GroupId,
    /// Notify registry bucket count, fixed at startup.
    pub notify_hash_size: usize,
    /// Cache tier byte budget; zero disables the tier.
    pub cache_size: u64,
    pub wait_timeout: Duration,
    pub cache_sweep_interval: Duration,
}

impl NodeConfig {
    pub fn new(addr: impl Into<NodeAddr>, group: GroupId) -> NodeConfig {
        NodeConfig {
            addr: addr.into(),
            group,
            notify_hash_size: 256,
            cache_size: 0,
            wait_timeout: Duration::from_secs(30),
            cache_sweep_interval: Duration::from_secs(30),
        }
    }
}

/// One storage peer: a backend, a notify registry, an optional cache
/// tier, the route graph it shares with its sessions, and the inbound
/// frame loop feeding the command router.
pub struct Node {
    config: NodeConfig,
    backend: Arc<dyn Backend>,
    cache: Option<Arc<CacheTier>>,
    notify: Arc<NotifyRegistry>,
    routes: Arc<RouteGraph>,
    transport: Arc<dyn FrameTransport>,
    transactions: Arc<TransactionPool>,
    router: Arc<CommandRouter>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        backend: Arc<dyn Backend>,
        transport: Arc<dyn FrameTransport>,
    ) -> Result<Arc<Node>> {
        let notify = Arc::new(NotifyRegistry::new(config.notify_hash_size)?);
        let cache = (config.cache_size > 0).then(|| Arc::new(CacheTier::new(config.cache_size)));
        let routes = Arc::new(RouteGraph::new());
        routes.insert(config.group, RouteEntry::for_addr(config.addr.clone()));

        let router = Arc::new(CommandRouter::new(
            config.addr.clone(),
            Arc::clone(&backend),
            cache.clone(),
            Arc::clone(&notify),
            Arc::clone(&transport),
        ));

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Node {
            config,
            backend,
            cache,
            notify,
            routes,
            transport,
            transactions: TransactionPool::new(),
            router,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Start serving inbound frames from `inbox`.
    pub fn start(self: &Arc<Self>, mut inbox: mpsc::UnboundedReceiver<(NodeAddr, Frame)>) {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let serve = tokio::spawn(async move {
            loop {
                tokio::select! {
                    inbound = inbox.recv() => {
                        let Some((from, frame)) = inbound else { break };
                        node.dispatch_inbound(from, frame);
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("node {} stopped serving", node.config.addr);
        });

        let mut handles = vec![serve];
        if let Some(cache) = self.cache.clone() {
            let interval = self.config.cache_sweep_interval;
            let mut shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => cache.sweep(),
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        self.tasks.lock().extend(handles);
        tracing::info!(
            "node {} serving group {}",
            self.config.addr,
            self.config.group
        );
    }

    fn dispatch_inbound(self: &Arc<Self>, from: NodeAddr, frame: Frame) {
        if frame.header.is_reply() {
            self.transactions.complete(frame);
            return;
        }

        let node = Arc::clone(self);
        tokio::spawn(async move {
            let responses = node.router.handle(&from, frame).await;
            for response in responses {
                if let Err(error) = node
                    .transport
                    .send(&node.config.addr, &from, response)
                    .await
                {
                    tracing::debug!("reply to {} lost: {}", from, error);
                    break;
                }
            }
        });
    }

    /// Stop serving, close every remaining subscription.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.notify.shutdown();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("node {} shut down", self.config.addr);
    }

    /// Make a peer known for `group`.
    pub fn add_peer(&self, group: GroupId, addr: NodeAddr) {
        self.routes.insert(group, RouteEntry::for_addr(addr));
    }

    pub fn remove_peer(&self, addr: &NodeAddr) {
        self.routes.remove_addr(addr);
    }

    pub fn addr(&self) -> &NodeAddr {
        &self.config.addr
    }

    pub fn group(&self) -> GroupId {
        self.config.group
    }

    pub fn wait_timeout(&self) -> Duration {
        self.config.wait_timeout
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn routes(&self) -> &Arc<RouteGraph> {
        &self.routes
    }

    pub fn transactions(&self) -> &Arc<TransactionPool> {
        &self.transactions
    }

    pub fn transport(&self) -> &Arc<dyn FrameTransport> {
        &self.transport
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
