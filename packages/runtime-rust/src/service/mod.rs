//! Service lifecycle kernel.
//!
//! A [`Service`] composes a client, a server and the broker, registry and
//! transport they share, and drives them through start, run and stop with
//! user hooks around each phase.

pub mod lifecycle;
pub mod options;
pub mod rpc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use xmicro_core::constants::DEFAULT_PROTOCOL;
use xmicro_core::{Message, Request, Response};

use crate::broker::{Handler, SubscribeOptions};
use crate::client::{new_message, Client, ClientError};
use crate::component::{get_service_factory, install_defaults};
use crate::server::{RequestHandler, Server, ServerError};

pub use lifecycle::{Lifecycle, LifecycleState};
pub use options::{hook, Hook, ServiceOption, ServiceOptions};
pub use rpc::{RpcService, RpcServiceFactory};

#[async_trait]
pub trait Service: Send + Sync {
    /// Registry name, taken from the server options.
    fn name(&self) -> String;

    /// Applies `opts` to the current option snapshot.
    ///
    /// # Errors
    ///
    /// Fails without applying anything unless the service is `Created` or
    /// `Stopped`, so client, server and service never disagree on backends.
    fn init(&self, opts: Vec<ServiceOption>) -> anyhow::Result<()>;

    fn options(&self) -> ServiceOptions;

    fn client(&self) -> Arc<dyn Client>;

    fn server(&self) -> Arc<dyn Server>;

    fn state(&self) -> LifecycleState;

    async fn call(&self, request: Request) -> Result<Response, ClientError>;

    /// # Errors
    ///
    /// Returns [`ServerError::DuplicateHandler`] if the name is taken.
    fn handle(&self, handler: Arc<dyn RequestHandler>) -> Result<(), ServerError>;

    /// Publishes `message` on `topic` through the client.
    async fn broadcast(&self, topic: &str, message: Message) -> Result<(), ClientError>;

    /// Subscribes through the server; bound on start if not yet running.
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        options: SubscribeOptions,
    ) -> Result<(), ServerError>;

    /// Runs `before_start` hooks, starts the server, then runs `after_start`
    /// hooks.
    ///
    /// # Errors
    ///
    /// Returns the first failing `before_start` hook or server start error,
    /// in which case the server is not running. A failing `after_start` hook
    /// is returned as well, but the service stays running.
    async fn start(&self) -> anyhow::Result<()>;

    /// Runs `before_stop` hooks, stops the server, then runs `after_stop`
    /// hooks.
    ///
    /// # Errors
    ///
    /// A server stop failure is returned immediately and `after_stop` hooks
    /// are skipped. Otherwise every hook runs and the last hook failure is
    /// returned.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Starts, waits for the context token (or Ctrl-C when signal handling
    /// is on), then stops.
    ///
    /// # Errors
    ///
    /// Returns the start error without stopping, or the stop error.
    async fn run(&self) -> anyhow::Result<()>;
}

impl fmt::Debug for dyn Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Typed helpers over [`Service::call`] and [`Service::broadcast`].
#[async_trait]
pub trait ServiceExt: Service {
    /// Encodes `payload` with the client codec, calls `service`/`endpoint`
    /// and decodes the response.
    async fn call_endpoint<T, R>(&self, service: &str, endpoint: &str, payload: &T) -> Result<R, ClientError>
    where
        T: Serialize + Sync + ?Sized,
        R: DeserializeOwned + Send,
    {
        let codec = self.client().options().codec;
        let request = Request::encode(service, endpoint, codec, payload)?;
        let response = self.call(request).await?;
        Ok(response.decode()?)
    }

    async fn publish_payload<T>(&self, topic: &str, payload: &T) -> Result<(), ClientError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let message = new_message(self.client().options().codec, payload)?;
        self.broadcast(topic, message).await
    }
}

impl<S: Service + ?Sized> ServiceExt for S {}

/// Builds a service from an option snapshot.
pub trait ServiceFactory: Send + Sync {
    fn get_service(&self, options: ServiceOptions) -> Arc<dyn Service>;
}

/// Builds a service with the `"rpc"` factory from the locator.
///
/// # Panics
///
/// Panics if the `"rpc"` factory was replaced by nothing, which
/// [`install_defaults`] rules out.
#[must_use]
pub fn new_service(opts: Vec<ServiceOption>) -> Arc<dyn Service> {
    install_defaults();
    get_service_factory(DEFAULT_PROTOCOL).get_service(ServiceOptions::with(opts))
}
