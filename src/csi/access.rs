//! Access logging for every RPC, applied as a tower layer on the server.
//!
//! Logs a start marker when a request arrives and a finish marker with the
//! wall-clock duration and the gRPC status once the response is produced.
//! Applied below tonic's codec, so it sees every method uniformly and no
//! service handler has to remember to log.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use pin_project_lite::pin_project;
use tower::{Layer, Service};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct AccessLogLayer;

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLog<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLog { inner }
    }
}

#[derive(Debug, Clone)]
pub struct AccessLog<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for AccessLog<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = AccessLogFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let path = req.uri().path().to_string();
        info!(%path, "rpc start");
        AccessLogFuture {
            inner: self.inner.call(req),
            path,
            start: Instant::now(),
        }
    }
}

pin_project! {
    pub struct AccessLogFuture<F> {
        #[pin]
        inner: F,
        path: String,
        start: Instant,
    }
}

impl<F, ResBody, E> Future for AccessLogFuture<F>
where
    F: Future<Output = Result<http::Response<ResBody>, E>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let res = match this.inner.poll(cx) {
            Poll::Ready(res) => res,
            Poll::Pending => return Poll::Pending,
        };
        let elapsed_ms = this.start.elapsed().as_millis() as u64;
        match &res {
            Ok(resp) => {
                // unary failures surface grpc-status in the headers; a
                // missing header means the status rides in the trailers (ok)
                let status = resp
                    .headers()
                    .get("grpc-status")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("0");
                if status == "0" {
                    info!(path = %this.path, elapsed_ms, "rpc finished");
                } else {
                    warn!(path = %this.path, grpc_status = %status, elapsed_ms, "rpc failed");
                }
            }
            Err(_) => {
                warn!(path = %this.path, elapsed_ms, "rpc transport error");
            }
        }
        Poll::Ready(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[derive(Clone)]
    struct Echo;

    impl Service<http::Request<()>> for Echo {
        type Response = http::Response<String>;
        type Error = Infallible;
        type Future =
            std::future::Ready<Result<http::Response<String>, Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<()>) -> Self::Future {
            let body = req.uri().path().to_string();
            std::future::ready(Ok(http::Response::new(body)))
        }
    }

    #[tokio::test]
    async fn test_layer_passes_response_through() {
        let mut svc = AccessLogLayer.layer(Echo);
        let req = http::Request::builder()
            .uri("/csi.v1.Controller/CreateVolume")
            .body(())
            .unwrap();
        let resp = svc.call(req).await.unwrap();
        assert_eq!(resp.body(), "/csi.v1.Controller/CreateVolume");
    }
}
