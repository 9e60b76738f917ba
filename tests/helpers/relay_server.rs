//! Serve a `RelayService` on a loopback port and talk to it over HTTP.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use peek_relay::logging_layer::logging_layer;
use peek_relay::proxy_service::{RelayService, UnifiedBody};
use tokio::net::TcpListener;
use tower::{Service, ServiceBuilder};

/// Accept connections on an ephemeral port until the test runtime stops.
pub async fn spawn_relay(service: RelayService) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stack = ServiceBuilder::new().layer(logging_layer()).service(service);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let stack = stack.clone();
            tokio::spawn(async move {
                let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
                    let mut stack = stack.clone();
                    async move {
                        let response: Response<UnifiedBody> = match stack.call(req).await {
                            Ok(response) => response.map(|body| body.boxed_unsync()),
                            Err(e) => e.to_response().map(|body| {
                                body.map_err(|never: Infallible| match never {})
                                    .boxed_unsync()
                            }),
                        };
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    addr
}

pub fn http_client() -> Client<HttpConnector, Empty<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

/// GET `path` from the relay at `addr`.
pub async fn get(addr: SocketAddr, path: &str) -> Response<Incoming> {
    let uri = format!("http://{addr}{path}");
    http_client()
        .get(uri.parse().unwrap())
        .await
        .unwrap()
}
