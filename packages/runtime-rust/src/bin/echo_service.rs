//! Echo service over the in-memory backends.
//!
//! Serves `Echo.Say`, calls itself once after start, and publishes every
//! echoed payload on the `echo.said` topic. Runs until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing::{info, warn};
use xmicro::broker::{handler_fn, Publication, SubscribeOptions};
use xmicro::client::new_message;
use xmicro::configuration::{ClientConfig, ServerConfig};
use xmicro::logging::{self, LogConfig, LogFormat};
use xmicro::server::{RequestHandler, ServerError};
use xmicro::service::{hook, options};
use xmicro::{new_service, Service, ServiceExt};
use xmicro_core::{Codec, Endpoint, Request, Response};

const SAID_TOPIC: &str = "echo.said";

#[derive(Debug, Parser)]
#[command(name = "echo-service", about = "xmicro echo demo")]
struct Args {
    /// Registry name of the service.
    #[arg(long, env = "ECHO_NAME", default_value = "echo")]
    name: String,

    /// Listen address; port 0 picks one.
    #[arg(long, env = "ECHO_ADDRESS", default_value = "127.0.0.1:0")]
    address: String,

    /// Selector strategy for outgoing calls.
    #[arg(long, default_value = "random")]
    selector: String,

    #[arg(long, env = "ECHO_LOG_FORMAT", value_enum, default_value = "fmt")]
    log_format: Format,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Format {
    Fmt,
    Json,
}

struct Echo {
    service: std::sync::Weak<dyn Service>,
}

#[async_trait]
impl RequestHandler for Echo {
    fn name(&self) -> &str {
        "Echo"
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        vec![Endpoint {
            name: "Echo.Say".to_string(),
            ..Endpoint::default()
        }]
    }

    async fn serve(&self, request: Request) -> Result<Response, ServerError> {
        let text: String = request.decode()?;
        if let Some(service) = self.service.upgrade() {
            let message = new_message(request.codec, &text)?;
            if let Err(err) = service.broadcast(SAID_TOPIC, message).await {
                warn!(error = %err, "echo broadcast failed");
            }
        }
        Ok(Response::encode(request.codec, &text)?)
    }
}

async fn self_call(service: Arc<dyn Service>, name: String) -> anyhow::Result<()> {
    let reply: String = service.call_endpoint(&name, "Echo.Say", "hello").await?;
    info!(%reply, "self-call succeeded");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&LogConfig {
        format: match args.log_format {
            Format::Fmt => LogFormat::Fmt,
            Format::Json => LogFormat::Json,
        },
        ..LogConfig::default()
    });

    let server = ServerConfig {
        name: args.name.clone(),
        address: args.address,
        ..ServerConfig::default()
    };
    let client = ClientConfig {
        selector: args.selector,
        ..ClientConfig::default()
    };
    let mut opts = server.service_options().context("invalid server configuration")?;
    opts.extend(client.service_options().context("invalid client configuration")?);

    let service = new_service(opts);
    service.handle(Arc::new(Echo {
        service: Arc::downgrade(&service),
    }))?;
    service
        .subscribe(
            SAID_TOPIC,
            handler_fn(|p: &dyn Publication| {
                let text: String = Codec::Json.unmarshal(&p.message().body)?;
                info!(topic = p.topic(), %text, "observed echo");
                Ok(())
            }),
            SubscribeOptions::default(),
        )
        .await?;

    let weak = Arc::downgrade(&service);
    let name = args.name;
    service.init(vec![options::after_start(hook(move || {
        let weak = weak.clone();
        let name = name.clone();
        async move {
            match weak.upgrade() {
                Some(service) => self_call(service, name).await,
                None => Ok(()),
            }
        }
    }))])?;

    service.run().await
}
