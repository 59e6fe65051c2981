//! Tower middleware running the admission check before the wrapped service.

use crate::engine::AdmissionEngine;
use crate::error::AdmissionServiceError;
use crate::identity::RequestMeta;
use crate::store::{CounterStore, InMemoryCounterStore};
use crate::telemetry::{NullSink, TelemetrySink};
use http::Request;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that admits or rejects requests with an [`AdmissionEngine`].
///
/// Admitted requests carry their [`Admission`](crate::engine::Admission) in the request
/// extensions. Rejected requests never reach the inner service; they fail with
/// [`AdmissionServiceError::Rejected`], which the server turns into a response with
/// [`QuotaExceeded::to_response`](crate::error::QuotaExceeded::to_response).
pub struct AdmissionLayer<S: ?Sized = InMemoryCounterStore, K = NullSink> {
    engine: Arc<AdmissionEngine<S, K>>,
}

impl<S: ?Sized, K> AdmissionLayer<S, K> {
    /// Create a new admission layer.
    pub fn new(engine: AdmissionEngine<S, K>) -> Self {
        Self { engine: Arc::new(engine) }
    }

    /// Share an engine that is also used elsewhere.
    pub fn from_shared(engine: Arc<AdmissionEngine<S, K>>) -> Self {
        Self { engine }
    }

    /// The engine.
    pub fn engine(&self) -> &Arc<AdmissionEngine<S, K>> {
        &self.engine
    }
}

impl<S: ?Sized, K> Clone for AdmissionLayer<S, K> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone() }
    }
}

impl<S: ?Sized, K> std::fmt::Debug for AdmissionLayer<S, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionLayer").field("engine", &self.engine).finish()
    }
}

impl<Svc, S: ?Sized, K> Layer<Svc> for AdmissionLayer<S, K> {
    type Service = AdmissionService<Svc, S, K>;

    fn layer(&self, service: Svc) -> Self::Service {
        AdmissionService { inner: service, engine: self.engine.clone() }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
pub struct AdmissionService<Svc, S: ?Sized = InMemoryCounterStore, K = NullSink> {
    inner: Svc,
    engine: Arc<AdmissionEngine<S, K>>,
}

impl<Svc: Clone, S: ?Sized, K> Clone for AdmissionService<Svc, S, K> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), engine: self.engine.clone() }
    }
}

impl<Svc: std::fmt::Debug, S: ?Sized, K> std::fmt::Debug for AdmissionService<Svc, S, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionService")
            .field("inner", &self.inner)
            .field("engine", &self.engine)
            .finish()
    }
}

impl<Svc, S, K, B> Service<Request<B>> for AdmissionService<Svc, S, K>
where
    Svc: Service<Request<B>> + Clone + Send + 'static,
    Svc::Future: Send + 'static,
    S: CounterStore + ?Sized + 'static,
    K: TelemetrySink + Sync,
    K::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Svc::Response;
    type Error = AdmissionServiceError<Svc::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionServiceError::Inner)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let prepared = self.engine.prepare(&RequestMeta::from_request(&req));
        let engine = self.engine.clone();
        // Keep the instance that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match engine.admit(prepared).await {
                Ok(admission) => {
                    req.extensions_mut().insert(admission);
                    inner.call(req).await.map_err(AdmissionServiceError::Inner)
                }
                Err(rejection) => Err(AdmissionServiceError::Rejected(rejection)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::degradation::DegradationPolicy;
    use crate::engine::Admission;
    use crate::error::RejectCause;
    use crate::identity::{PeerAddr, RouteId};
    use crate::rule::{Limit, RouteRule, RuleRegistry};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::{service_fn, ServiceExt};

    fn engine() -> AdmissionEngine {
        let rules = RuleRegistry::builder()
            .rule(RouteRule::new("chat", 2, Duration::from_secs(60)).unwrap())
            .default_limit(Limit::per_minute(100))
            .unwrap()
            .build()
            .unwrap();
        AdmissionEngine::builder(rules)
            .degradation(DegradationPolicy::FailClosed)
            .clock(ManualClock::new())
            .build()
            .unwrap()
    }

    fn request() -> Request<()> {
        let mut req = Request::builder().uri("/v1/chat/completions").body(()).unwrap();
        req.extensions_mut().insert(RouteId::new("chat"));
        req.extensions_mut().insert(PeerAddr("192.0.2.1:4000".parse().unwrap()));
        req
    }

    #[tokio::test]
    async fn rejects_without_calling_inner_service() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let inner = service_fn(move |req: Request<()>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let remaining = req
                    .extensions()
                    .get::<Admission>()
                    .and_then(|a| a.decision().map(|d| d.remaining));
                Ok::<_, Infallible>(remaining)
            }
        });
        let svc = AdmissionLayer::new(engine()).layer(inner);

        assert_eq!(svc.clone().oneshot(request()).await.unwrap(), Some(1));
        assert_eq!(svc.clone().oneshot(request()).await.unwrap(), Some(0));
        let err = svc.clone().oneshot(request()).await.unwrap_err();
        assert!(err.is_rejected());
        let rejection = err.rejection().unwrap();
        assert_eq!(rejection.cause, RejectCause::Quota);
        assert_eq!(&*rejection.route, "chat");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn inner_errors_pass_through() {
        let inner = service_fn(|_req: Request<()>| async {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "handler failed"))
        });
        let svc = AdmissionLayer::new(engine()).layer(inner);
        let err = svc.oneshot(request()).await.unwrap_err();
        assert!(!err.is_rejected());
        assert_eq!(err.to_string(), "handler failed");
    }

    #[tokio::test]
    async fn layer_clones_share_the_engine() {
        let layer = AdmissionLayer::new(engine());
        let inner = service_fn(|_req: Request<()>| async { Ok::<_, Infallible>(()) });
        let a = layer.layer(inner.clone());
        let b = layer.clone().layer(inner);

        a.oneshot(request()).await.unwrap();
        b.clone().oneshot(request()).await.unwrap();
        assert!(b.oneshot(request()).await.is_err());
    }
}
