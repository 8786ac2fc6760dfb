//! Default client: registry lookup, selector pick, transport send.
//!
//! Exactly one attempt per call. The outcome is reported to the selector so
//! strategies can adapt, but nothing is retried here.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;
use xmicro_core::{Message, Request, Response, Service};

use super::{Client, ClientError, ClientOptions};
use crate::broker::PublishOptions;
use crate::registry::{GetOptions, RegistryError};
use crate::selector::SelectOptions;

pub struct RpcClient {
    options: RwLock<ClientOptions>,
}

impl RpcClient {
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options: RwLock::new(options),
        }
    }

    async fn resolve(&self, opts: &ClientOptions, service: &str) -> Result<Vec<String>, ClientError> {
        let lookup = opts.registry.get_service(service, GetOptions::default());
        let services = match tokio::time::timeout(opts.connect_timeout, lookup).await {
            Ok(Ok(services)) => services,
            Ok(Err(RegistryError::NotFound)) => return Err(ClientError::ServiceNotFound(service.to_string())),
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(ClientError::ConnectTimeout {
                    service: service.to_string(),
                    timeout: opts.connect_timeout,
                })
            }
        };
        Ok(services.iter().flat_map(Service::addresses).collect())
    }
}

#[async_trait]
impl Client for RpcClient {
    fn name(&self) -> &'static str {
        "rpc"
    }

    fn options(&self) -> ClientOptions {
        self.options.read().clone()
    }

    fn init(&self, options: ClientOptions) {
        *self.options.write() = options;
    }

    async fn call(&self, request: Request) -> Result<Response, ClientError> {
        let opts = self.options();
        let routes = self.resolve(&opts, &request.service).await?;
        let mut next = opts.selector.select(&routes, &SelectOptions::default())?;
        let address = next();

        let service = request.service.clone();
        let endpoint = request.endpoint.clone();
        debug!(%service, %endpoint, %address, "calling");

        let result = match tokio::time::timeout(opts.request_timeout, opts.transport.send(&address, request)).await {
            Ok(sent) => sent.map_err(ClientError::from),
            Err(_) => Err(ClientError::Timeout {
                service,
                endpoint,
                timeout: opts.request_timeout,
            }),
        };

        match &result {
            Ok(_) => opts.selector.record(&address, None),
            Err(err) => opts.selector.record(&address, Some(err)),
        }
        result
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<(), ClientError> {
        let broker = Arc::clone(&self.options.read().broker);
        broker.publish(topic, &message, PublishOptions::default()).await?;
        Ok(())
    }
}
