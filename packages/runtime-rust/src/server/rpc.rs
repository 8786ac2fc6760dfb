//! Default server: routes `Handler.Method` requests arriving on a transport
//! listener and keeps its node registered while running.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xmicro_core::{Endpoint, Node, Request, Response, Service};

use super::{HandlerWrapper, RequestHandler, Server, ServerError, ServerOptions, ServerSubscriber};
use crate::broker::Subscriber;
use crate::registry::{DeregisterOptions, RegisterOptions, Registry};
use crate::transport::{Listener, TransportHandler};

type Handlers = Arc<DashMap<String, Arc<dyn RequestHandler>>>;

/// Resources held between `start` and `stop`.
struct Running {
    listener: Box<dyn Listener>,
    registration: Service,
    subscriptions: Vec<Box<dyn Subscriber>>,
    cancel: CancellationToken,
    refresh: Option<JoinHandle<()>>,
}

pub struct RpcServer {
    options: RwLock<ServerOptions>,
    handlers: Handlers,
    subscribers: Mutex<Vec<ServerSubscriber>>,
    running: tokio::sync::Mutex<Option<Running>>,
    address: RwLock<Option<String>>,
}

impl RpcServer {
    #[must_use]
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options: RwLock::new(options),
            handlers: Arc::new(DashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            running: tokio::sync::Mutex::new(None),
            address: RwLock::new(None),
        }
    }

    fn registration(&self, opts: &ServerOptions, address: &str) -> Service {
        let mut endpoints: Vec<Endpoint> = self.handlers.iter().flat_map(|h| h.value().endpoints()).collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));

        let mut node = Node::new(format!("{}-{}", opts.name, opts.id), address);
        node.metadata.clone_from(&opts.metadata);
        node.metadata.insert("server".to_string(), self.name().to_string());
        node.metadata.insert("transport".to_string(), opts.transport.name().to_string());
        node.metadata.insert("broker".to_string(), opts.broker.name().to_string());
        node.metadata.insert("registry".to_string(), opts.registry.name().to_string());

        Service {
            name: opts.name.clone(),
            version: opts.version.clone(),
            metadata: opts.metadata.clone(),
            endpoints,
            nodes: vec![node],
        }
    }

    fn dispatch_chain(&self, wrappers: &[Arc<dyn HandlerWrapper>]) -> Arc<dyn RequestHandler> {
        let router: Arc<dyn RequestHandler> = Arc::new(Router {
            handlers: Arc::clone(&self.handlers),
        });
        // Wrap in reverse so the first registered wrapper runs outermost.
        wrappers.iter().rev().fold(router, |inner, wrapper| wrapper.wrap(inner))
    }

    async fn bind_subscribers(
        opts: &ServerOptions,
        pending: Vec<ServerSubscriber>,
    ) -> Result<Vec<Box<dyn Subscriber>>, ServerError> {
        let mut bound = Vec::with_capacity(pending.len());
        for sub in pending {
            match opts.broker.subscribe(&sub.topic, sub.handler, sub.options).await {
                Ok(s) => bound.push(s),
                Err(err) => {
                    for s in &bound {
                        let _ = s.unsubscribe().await;
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(bound)
    }
}

/// Keeps the node alive in the registry until cancelled.
async fn refresh_registration(
    registry: Arc<dyn Registry>,
    service: Service,
    opts: RegisterOptions,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match registry.register(&service, opts.clone()).await {
                    Ok(()) => debug!(service = %service.name, "registration refreshed"),
                    Err(err) => warn!(service = %service.name, error = %err, "registration refresh failed"),
                }
            }
        }
    }
}

#[async_trait]
impl Server for RpcServer {
    fn name(&self) -> &'static str {
        "rpc"
    }

    fn options(&self) -> ServerOptions {
        self.options.read().clone()
    }

    fn init(&self, options: ServerOptions) -> Result<(), ServerError> {
        if self.address.read().is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        *self.options.write() = options;
        Ok(())
    }

    fn handle(&self, handler: Arc<dyn RequestHandler>) -> Result<(), ServerError> {
        match self.handlers.entry(handler.name().to_string()) {
            Entry::Occupied(e) => Err(ServerError::DuplicateHandler(e.key().clone())),
            Entry::Vacant(e) => {
                debug!(handler = e.key(), "handler registered");
                e.insert(handler);
                Ok(())
            }
        }
    }

    async fn subscribe(&self, subscriber: ServerSubscriber) -> Result<(), ServerError> {
        let mut running = self.running.lock().await;
        if let Some(running) = running.as_mut() {
            let opts = self.options();
            let bound = opts
                .broker
                .subscribe(&subscriber.topic, Arc::clone(&subscriber.handler), subscriber.options.clone())
                .await?;
            running.subscriptions.push(bound);
        }
        self.subscribers.lock().push(subscriber);
        Ok(())
    }

    fn address(&self) -> Option<String> {
        self.address.read().clone()
    }

    async fn start(&self) -> Result<(), ServerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        let opts = self.options();

        opts.broker.connect().await?;

        let chain = self.dispatch_chain(&opts.wrappers);
        let listener = match opts.transport.listen(&opts.address, Arc::new(Dispatch { chain })).await {
            Ok(listener) => listener,
            Err(err) => {
                release_broker(&opts).await;
                return Err(err.into());
            }
        };
        let address = opts
            .advertise
            .clone()
            .unwrap_or_else(|| listener.address().to_string());

        let registration = self.registration(&opts, &address);
        let register_opts = RegisterOptions {
            ttl: Some(opts.register_ttl),
            domain: None,
        };
        if let Err(err) = opts.registry.register(&registration, register_opts.clone()).await {
            let _ = listener.close().await;
            release_broker(&opts).await;
            return Err(err.into());
        }

        let pending = self.subscribers.lock().clone();
        let subscriptions = match Self::bind_subscribers(&opts, pending).await {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                let _ = opts
                    .registry
                    .deregister(&registration, DeregisterOptions::default())
                    .await;
                let _ = listener.close().await;
                release_broker(&opts).await;
                return Err(err);
            }
        };

        let cancel = CancellationToken::new();
        let refresh = (!opts.register_interval.is_zero()).then(|| {
            tokio::spawn(refresh_registration(
                Arc::clone(&opts.registry),
                registration.clone(),
                register_opts,
                opts.register_interval,
                cancel.clone(),
            ))
        });

        info!(
            service = %opts.name,
            version = %opts.version,
            %address,
            handlers = self.handlers.len(),
            subscribers = subscriptions.len(),
            "server started"
        );
        *self.address.write() = Some(address);
        *running = Some(Running {
            listener,
            registration,
            subscriptions,
            cancel,
            refresh,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServerError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        let opts = self.options();
        let mut first_error: Option<ServerError> = None;

        running.cancel.cancel();
        if let Some(refresh) = running.refresh {
            if let Err(err) = refresh.await {
                warn!(error = %err, "registration refresh task ended abnormally");
            }
        }

        if let Err(err) = opts
            .registry
            .deregister(&running.registration, DeregisterOptions::default())
            .await
        {
            warn!(service = %opts.name, error = %err, "deregister failed");
            first_error.get_or_insert(err.into());
        }
        for sub in &running.subscriptions {
            if let Err(err) = sub.unsubscribe().await {
                warn!(topic = sub.topic(), error = %err, "unsubscribe failed");
                first_error.get_or_insert(err.into());
            }
        }
        if let Err(err) = running.listener.close().await {
            warn!(error = %err, "listener close failed");
            first_error.get_or_insert(err.into());
        }
        if let Err(err) = opts.broker.disconnect().await {
            warn!(error = %err, "broker disconnect failed");
            first_error.get_or_insert(err.into());
        }

        *self.address.write() = None;
        info!(service = %opts.name, "server stopped");
        first_error.map_or(Ok(()), Err)
    }
}

/// Undoes the broker connect of a failed start.
async fn release_broker(opts: &ServerOptions) {
    if let Err(err) = opts.broker.disconnect().await {
        warn!(error = %err, "broker disconnect after failed start");
    }
}

/// Routes by the `Handler` part of the endpoint.
struct Router {
    handlers: Handlers,
}

#[async_trait]
impl RequestHandler for Router {
    fn name(&self) -> &str {
        "router"
    }

    async fn serve(&self, request: Request) -> Result<Response, ServerError> {
        let name = match request.handler_method() {
            Some((handler, _)) => handler.to_string(),
            None => return Err(ServerError::MalformedEndpoint(request.endpoint.clone())),
        };
        let handler = self
            .handlers
            .get(&name)
            .map(|h| Arc::clone(h.value()))
            .ok_or(ServerError::UnknownHandler(name))?;
        handler.serve(request).await
    }
}

/// Adapts the dispatch chain to the transport.
struct Dispatch {
    chain: Arc<dyn RequestHandler>,
}

#[async_trait]
impl TransportHandler for Dispatch {
    async fn serve(&self, request: Request) -> anyhow::Result<Response> {
        Ok(self.chain.serve(request).await?)
    }
}
