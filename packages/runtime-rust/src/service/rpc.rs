//! Default service: an rpc client and server over shared backends.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{error, info, warn};
use xmicro_core::{Message, Request, Response};

use super::{Lifecycle, LifecycleState, Service, ServiceFactory, ServiceOption, ServiceOptions};
use crate::broker::{Handler, SubscribeOptions};
use crate::client::{Client, ClientError};
use crate::server::{RequestHandler, Server, ServerError};

pub struct RpcService {
    options: RwLock<ServiceOptions>,
    lifecycle: Lifecycle,
}

impl RpcService {
    #[must_use]
    pub fn new(options: ServiceOptions) -> Self {
        Self {
            options: RwLock::new(options),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Lifecycle tracker, for callers that want to await a state.
    #[must_use]
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

#[async_trait]
impl Service for RpcService {
    fn name(&self) -> String {
        self.server().options().name
    }

    fn init(&self, opts: Vec<ServiceOption>) -> anyhow::Result<()> {
        let mut options = self.options.write();
        let state = self.state();
        if !matches!(state, LifecycleState::Created | LifecycleState::Stopped) {
            bail!("service options cannot change while {state:?}");
        }
        if let Some(address) = options.server.address() {
            bail!("service options cannot change while the server listens on {address}");
        }
        options.apply(opts);
        Ok(())
    }

    fn options(&self) -> ServiceOptions {
        self.options.read().clone()
    }

    fn client(&self) -> Arc<dyn Client> {
        Arc::clone(&self.options.read().client)
    }

    fn server(&self) -> Arc<dyn Server> {
        Arc::clone(&self.options.read().server)
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    async fn call(&self, request: Request) -> Result<Response, ClientError> {
        self.client().call(request).await
    }

    fn handle(&self, handler: Arc<dyn RequestHandler>) -> Result<(), ServerError> {
        self.server().handle(handler)
    }

    async fn broadcast(&self, topic: &str, message: Message) -> Result<(), ClientError> {
        self.client().publish(topic, message).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        options: SubscribeOptions,
    ) -> Result<(), ServerError> {
        let server = self.server();
        let subscriber = server.new_subscriber(topic, handler, options);
        server.subscribe(subscriber).await
    }

    async fn start(&self) -> anyhow::Result<()> {
        let name = self.name();
        if let Err(state) = self
            .lifecycle
            .transition_unless(&[LifecycleState::Starting, LifecycleState::Running], LifecycleState::Starting)
        {
            bail!("service {name} already started (state {state:?})");
        }
        let opts = self.options();
        info!(service = %name, "starting service");

        for hook in &opts.before_start {
            if let Err(err) = hook().await {
                warn!(service = %name, error = %err, "before-start hook failed");
                self.lifecycle.transition(LifecycleState::Created);
                return Err(err);
            }
        }

        if let Err(err) = opts.server.start().await {
            self.lifecycle.transition(LifecycleState::Created);
            return Err(err.into());
        }
        self.lifecycle.transition(LifecycleState::Running);

        for hook in &opts.after_start {
            if let Err(err) = hook().await {
                error!(service = %name, error = %err, "after-start hook failed");
                return Err(err);
            }
        }
        info!(service = %name, "service started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let opts = self.options();
        let name = self.name();
        self.lifecycle.transition(LifecycleState::Stopping);
        info!(service = %name, "stopping service");

        let mut last_error = None;
        for hook in &opts.before_stop {
            if let Err(err) = hook().await {
                warn!(service = %name, error = %err, "before-stop hook failed");
                last_error = Some(err);
            }
        }

        opts.server.stop().await?;

        for hook in &opts.after_stop {
            if let Err(err) = hook().await {
                warn!(service = %name, error = %err, "after-stop hook failed");
                last_error = Some(err);
            }
        }

        self.lifecycle.transition(LifecycleState::Stopped);
        info!(service = %name, "service stopped");
        last_error.map_or(Ok(()), Err)
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.start().await?;

        let opts = self.options();
        if opts.signal {
            tokio::select! {
                () = opts.context.cancelled() => info!("context cancelled"),
                res = tokio::signal::ctrl_c() => match res {
                    Ok(()) => info!("received interrupt"),
                    Err(err) => {
                        warn!(error = %err, "cannot listen for interrupt; waiting for cancellation");
                        opts.context.cancelled().await;
                    }
                },
            }
        } else {
            opts.context.cancelled().await;
        }

        self.stop().await
    }
}

/// Registered as `"rpc"` by [`crate::component::install_defaults`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RpcServiceFactory;

impl ServiceFactory for RpcServiceFactory {
    fn get_service(&self, options: ServiceOptions) -> Arc<dyn Service> {
        Arc::new(RpcService::new(options))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use xmicro_core::{Codec, Endpoint};

    use super::*;
    use crate::broker::{handler_fn, Publication};
    use crate::registry::{GetOptions, MemoryRegistry, Registry};
    use crate::server::ServerOptions;
    use crate::service::{hook, options, Hook, ServiceExt};
    use crate::transport::MemoryTransport;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn step(log: &Log, label: &'static str, fail: bool) -> Hook {
        let log = Arc::clone(log);
        hook(move || {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(label);
                if fail {
                    bail!("{label} failed");
                }
                Ok(())
            }
        })
    }

    /// Service on a private registry and transport.
    fn isolated(name: &str, mut extra: Vec<ServiceOption>) -> (Arc<dyn Service>, Arc<dyn Registry>) {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let mut opts = vec![
            options::name(name),
            options::registry(Arc::clone(&registry)),
            options::transport(Arc::new(MemoryTransport::new())),
            options::register_interval(Duration::ZERO),
            options::handle_signal(false),
        ];
        opts.append(&mut extra);
        (RpcServiceFactory.get_service(ServiceOptions::with(opts)), registry)
    }

    struct Greeter;

    #[async_trait]
    impl RequestHandler for Greeter {
        fn name(&self) -> &str {
            "Greeter"
        }

        fn endpoints(&self) -> Vec<Endpoint> {
            vec![Endpoint {
                name: "Greeter.Hello".to_string(),
                ..Endpoint::default()
            }]
        }

        async fn serve(&self, request: Request) -> Result<Response, ServerError> {
            let name: String = request.decode()?;
            Ok(Response::encode(request.codec, &format!("hello {name}"))?)
        }
    }

    /// Server whose stop always fails.
    struct StuckServer {
        options: ServerOptions,
    }

    #[async_trait]
    impl Server for StuckServer {
        fn name(&self) -> &'static str {
            "stuck"
        }

        fn options(&self) -> ServerOptions {
            self.options.clone()
        }

        fn init(&self, _options: ServerOptions) -> Result<(), ServerError> {
            Ok(())
        }

        fn handle(&self, _handler: Arc<dyn RequestHandler>) -> Result<(), ServerError> {
            Ok(())
        }

        async fn subscribe(&self, _subscriber: crate::server::ServerSubscriber) -> Result<(), ServerError> {
            Ok(())
        }

        fn address(&self) -> Option<String> {
            None
        }

        async fn start(&self) -> Result<(), ServerError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), ServerError> {
            Err(ServerError::Handler(anyhow::anyhow!("listener wedged")))
        }
    }

    #[tokio::test]
    async fn hooks_run_in_order_around_server() {
        let log: Log = Arc::default();
        let (svc, registry) = isolated(
            "svc-order",
            vec![
                options::before_start(step(&log, "before_start_1", false)),
                options::before_start(step(&log, "before_start_2", false)),
                options::after_start(step(&log, "after_start", false)),
                options::before_stop(step(&log, "before_stop", false)),
                options::after_stop(step(&log, "after_stop", false)),
            ],
        );
        assert_eq!(svc.state(), LifecycleState::Created);

        svc.start().await.unwrap();
        assert_eq!(svc.state(), LifecycleState::Running);
        assert_eq!(*log.lock(), vec!["before_start_1", "before_start_2", "after_start"]);
        assert!(svc.server().address().is_some());
        assert_eq!(registry.get_service("svc-order", GetOptions::default()).await.unwrap().len(), 1);

        svc.stop().await.unwrap();
        assert_eq!(svc.state(), LifecycleState::Stopped);
        assert_eq!(
            *log.lock(),
            vec!["before_start_1", "before_start_2", "after_start", "before_stop", "after_stop"]
        );
        assert!(registry.get_service("svc-order", GetOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn failing_before_start_aborts_without_starting_server() {
        let log: Log = Arc::default();
        let (svc, registry) = isolated(
            "svc-abort",
            vec![
                options::before_start(step(&log, "first", true)),
                options::before_start(step(&log, "second", false)),
            ],
        );

        let err = svc.start().await.unwrap_err();
        assert_eq!(err.to_string(), "first failed");
        assert_eq!(*log.lock(), vec!["first"]);
        assert_eq!(svc.state(), LifecycleState::Created);
        assert!(svc.server().address().is_none());
        assert!(registry.get_service("svc-abort", GetOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn failing_after_start_still_counts_as_started() {
        let log: Log = Arc::default();
        let (svc, _registry) = isolated(
            "svc-after-start",
            vec![
                options::after_start(step(&log, "x", true)),
                options::after_start(step(&log, "y", false)),
            ],
        );

        let err = svc.start().await.unwrap_err();
        assert_eq!(err.to_string(), "x failed");
        assert_eq!(*log.lock(), vec!["x"]);
        assert_eq!(svc.state(), LifecycleState::Running);
        assert!(svc.server().address().is_some());

        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn second_start_is_refused() {
        let (svc, _registry) = isolated("svc-twice", Vec::new());
        svc.start().await.unwrap();
        assert!(svc.start().await.is_err());
        assert_eq!(svc.state(), LifecycleState::Running);
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_runs_every_hook_and_returns_last_error() {
        let log: Log = Arc::default();
        let (svc, _registry) = isolated(
            "svc-stop",
            vec![
                options::before_stop(step(&log, "a", true)),
                options::before_stop(step(&log, "b", true)),
                options::after_stop(step(&log, "c", true)),
                options::after_stop(step(&log, "d", false)),
            ],
        );
        svc.start().await.unwrap();

        let err = svc.stop().await.unwrap_err();
        assert_eq!(err.to_string(), "c failed");
        assert_eq!(*log.lock(), vec!["a", "b", "c", "d"]);
        assert_eq!(svc.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn server_stop_failure_skips_after_stop() {
        let log: Log = Arc::default();
        let base = ServiceOptions::new();
        let stuck = Arc::new(StuckServer {
            options: base.server.options(),
        });
        let (svc, _registry) = isolated(
            "svc-stuck",
            vec![
                options::server(stuck),
                options::before_stop(step(&log, "before", true)),
                options::after_stop(step(&log, "after", false)),
            ],
        );
        svc.start().await.unwrap();

        let err = svc.stop().await.unwrap_err();
        assert!(err.to_string().contains("listener wedged"));
        assert_eq!(*log.lock(), vec!["before"]);
        assert_eq!(svc.state(), LifecycleState::Stopping);
    }

    #[tokio::test]
    async fn run_returns_after_context_cancelled() {
        let log: Log = Arc::default();
        let token = CancellationToken::new();
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let (svc, _registry) = isolated(
            "svc-run",
            vec![
                options::context(token.clone()),
                options::after_start(hook(move || {
                    let _ = started_tx.send(());
                    async { Ok::<(), anyhow::Error>(()) }
                })),
                options::after_stop(step(&log, "after_stop", false)),
            ],
        );

        let runner = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.run().await })
        };
        started_rx.recv().await.unwrap();
        assert_eq!(svc.state(), LifecycleState::Running);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .expect("run should return")
            .unwrap()
            .unwrap();
        assert_eq!(svc.state(), LifecycleState::Stopped);
        assert_eq!(*log.lock(), vec!["after_stop"]);
    }

    #[tokio::test]
    async fn run_surfaces_start_error_without_stopping() {
        let log: Log = Arc::default();
        let (svc, _registry) = isolated(
            "svc-run-fail",
            vec![
                options::before_start(step(&log, "boom", true)),
                options::after_stop(step(&log, "after_stop", false)),
            ],
        );
        assert!(svc.run().await.is_err());
        assert_eq!(*log.lock(), vec!["boom"]);
        assert_eq!(svc.state(), LifecycleState::Created);
    }

    #[tokio::test]
    async fn call_endpoint_reaches_registered_handler() {
        let (svc, _registry) = isolated("greeter", Vec::new());
        svc.handle(Arc::new(Greeter)).unwrap();
        svc.start().await.unwrap();

        let reply: String = svc.call_endpoint("greeter", "Greeter.Hello", "ann").await.unwrap();
        assert_eq!(reply, "hello ann");

        let missing = svc.call_endpoint::<_, String>("nobody", "X.Y", &()).await;
        assert!(matches!(missing, Err(ClientError::ServiceNotFound(_))));

        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_reaches_subscriber_bound_on_start() {
        let (svc, _registry) = isolated("svc-events", Vec::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |p: &dyn Publication| {
            let text: String = Codec::Json.unmarshal(&p.message().body)?;
            let _ = tx.send((p.topic().to_string(), text));
            Ok(())
        });
        svc.subscribe("events", handler, SubscribeOptions::default())
            .await
            .unwrap();
        svc.start().await.unwrap();

        svc.publish_payload("events", "created").await.unwrap();
        let (topic, text) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(topic, "events");
        assert_eq!(text, "created");

        svc.stop().await.unwrap();
    }

    #[test]
    fn init_applies_options_to_snapshot() {
        let (svc, _registry) = isolated("before-rename", Vec::new());
        svc.init(vec![options::name("after-rename")]).unwrap();
        assert_eq!(svc.name(), "after-rename");
    }

    #[tokio::test]
    async fn init_while_running_changes_nothing() {
        let (svc, _registry) = isolated("svc-locked", Vec::new());
        svc.start().await.unwrap();
        let before = svc.options();

        let replacement: Arc<dyn crate::broker::Broker> = Arc::new(crate::broker::MemoryBroker::new());
        let err = svc
            .init(vec![options::broker(Arc::clone(&replacement)), options::name("renamed")])
            .unwrap_err();
        assert!(err.to_string().contains("Running"));

        let after = svc.options();
        assert!(Arc::ptr_eq(&after.broker, &before.broker));
        assert!(!Arc::ptr_eq(&svc.client().options().broker, &replacement));
        assert!(!Arc::ptr_eq(&svc.server().options().broker, &replacement));
        assert_eq!(svc.name(), "svc-locked");
        svc.broadcast("still.connected", Message::default()).await.unwrap();

        svc.stop().await.unwrap();
        svc.init(vec![options::broker(Arc::clone(&replacement)), options::name("renamed")])
            .unwrap();
        assert!(Arc::ptr_eq(&svc.client().options().broker, &replacement));
        assert!(Arc::ptr_eq(&svc.server().options().broker, &replacement));
        assert_eq!(svc.name(), "renamed");
    }

    #[tokio::test]
    async fn concurrent_starts_admit_exactly_one() {
        let (svc, _registry) = isolated("svc-race", Vec::new());
        let (a, b) = tokio::join!(svc.start(), svc.start());
        assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1);
        assert_eq!(svc.state(), LifecycleState::Running);
        svc.stop().await.unwrap();
    }
}
