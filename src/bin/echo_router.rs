use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures::future::join_all;
use invocation_router::pipeline::operators::{inspect, map_message};
use invocation_router::{
    CallContext, Invocation, Router, RouterConfig, ServiceDescriptor, WorkFn, work_fn,
};
use prost::Message;
use tonic::Status;
use tracing::{info, warn};

const SERVICE: &str = "demo.EchoService";

#[derive(Clone, PartialEq, prost::Message)]
struct EchoRequest {
    #[prost(string, tag = "1")]
    message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct EchoResponse {
    #[prost(string, tag = "1")]
    message: String,
    #[prost(uint64, tag = "2")]
    elapsed_us: u64,
}

fn echo_handler() -> WorkFn<Bytes, Bytes> {
    work_fn(|ctx: &CallContext, payload: Bytes| {
        let request = EchoRequest::decode(payload)
            .map_err(|e| Status::invalid_argument(format!("bad request: {e}")))?;

        // Stand-in for real blocking work
        std::thread::sleep(Duration::from_millis(5));

        let response = EchoResponse {
            message: format!("response: {}", request.message),
            elapsed_us: ctx.received_at().elapsed().as_micros() as u64,
        };
        Ok(Bytes::from(response.encode_to_vec()))
    })
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let max_workers = env_or("MAX_WORKERS", 4usize);
    let calls = env_or("CALLS", 8usize);

    let service = ServiceDescriptor::new(SERVICE, ["Echo", "Shout"]);
    let config = RouterConfig::builder()
        .max_workers(max_workers)
        .thread_name_prefix("echo")
        .build();
    let router = Router::<Bytes, Bytes>::new(&service, config)?;

    let shout = service
        .method("Shout")
        .ok_or_else(|| anyhow::anyhow!("Shout missing from {SERVICE}"))?;
    router.pipe(
        &shout,
        (
            inspect(|invocation: &Invocation<Bytes, Bytes>| {
                info!(invocation = %invocation.id(), "Shout call received");
            }),
            map_message::<EchoRequest, Bytes>(|mut request| {
                request.message = request.message.to_uppercase();
                request
            }),
        ),
    )?;

    let subscription = router.subscribe()?;
    info!(methods = ?subscription.methods(), max_workers, "Serving");

    // Simulated transport: each call arrives with its own context and lazily decoded payload
    let pending = (0..calls).map(|i| {
        let method = if i % 2 == 0 { "Echo" } else { "Shout" };
        let descriptor = service.method(method);
        let path = descriptor.map(|d| d.full_path()).unwrap_or_else(|| method.into());

        let context = CallContext::builder().method(path.clone()).build();
        let request = EchoRequest {
            message: format!("message{i}"),
        };

        let reply = router.invoke(context, echo_handler(), move || {
            Bytes::from(request.encode_to_vec())
        });
        async move { (path, reply.await) }
    });

    for (path, outcome) in join_all(pending).await {
        match outcome.map(EchoResponse::decode) {
            Ok(Ok(response)) => info!(
                method = %path,
                message = %response.message,
                elapsed_us = response.elapsed_us,
                "Call completed"
            ),
            Ok(Err(e)) => warn!(method = %path, error = %e, "Undecodable response"),
            Err(status) => warn!(method = %path, status = %status, "Call failed"),
        }
    }

    router.shutdown();
    Ok(())
}
