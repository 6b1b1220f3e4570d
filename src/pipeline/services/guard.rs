use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::timeout::error::Elapsed;
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Service, ServiceBuilder, ServiceExt};
use tower_layer::Layer;
use tracing::{debug, warn};

use crate::config::CallPolicy;
use crate::error::CollaboratorError;

/// Retries a failed call once. Sits outside the timeout layer so the
/// second attempt runs under a fresh deadline.
#[derive(Debug, Clone)]
pub struct RetryOnceLayer {
    collaborator: &'static str,
    enabled: bool,
}

impl RetryOnceLayer {
    pub fn new(collaborator: &'static str, enabled: bool) -> Self {
        Self {
            collaborator,
            enabled,
        }
    }
}

impl<S> Layer<S> for RetryOnceLayer {
    type Service = RetryOnce<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryOnce {
            inner,
            collaborator: self.collaborator,
            enabled: self.enabled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryOnce<S> {
    inner: S,
    collaborator: &'static str,
    enabled: bool,
}

impl<S, Req> Service<Req> for RetryOnce<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
    Req: Clone + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Req) -> Self::Future {
        // Take the instance that was driven to readiness, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let collaborator = self.collaborator;
        let enabled = self.enabled;

        Box::pin(async move {
            if !enabled {
                return inner.call(request).await;
            }
            match inner.call(request.clone()).await {
                Ok(response) => Ok(response),
                Err(e) => {
                    warn!("{} call failed, retrying once: {}", collaborator, e);
                    inner.ready().await?.call(request).await
                }
            }
        })
    }
}

/// A collaborator call wrapped in the standard service stack:
/// concurrency limit → retry once → timeout → call.
///
/// Clones share the concurrency limit, so one `GuardedCall` per
/// collaborator bounds all in-flight requests of a pipeline.
pub struct GuardedCall<Req, Resp> {
    collaborator: &'static str,
    policy: CallPolicy,
    service: BoxCloneSyncService<Req, Resp, BoxError>,
}

impl<Req, Resp> Clone for GuardedCall<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            collaborator: self.collaborator,
            policy: self.policy,
            service: self.service.clone(),
        }
    }
}

impl<Req, Resp> GuardedCall<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    pub fn new<F, Fut>(
        collaborator: &'static str,
        policy: CallPolicy,
        pool_size: usize,
        call: F,
    ) -> Self
    where
        F: Fn(Req) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, CollaboratorError>> + Send + 'static,
    {
        let service = ServiceBuilder::new()
            .concurrency_limit(pool_size.max(1))
            .layer(RetryOnceLayer::new(collaborator, policy.retry_once))
            .timeout(policy.timeout())
            .service(tower::service_fn(call));

        Self {
            collaborator,
            policy,
            service: BoxCloneSyncService::new(service),
        }
    }

    pub async fn call(&self, request: Req) -> Result<Resp, CollaboratorError> {
        debug!("Calling {}", self.collaborator);
        self.service
            .clone()
            .oneshot(request)
            .await
            .map_err(|e| self.classify(e))
    }

    fn classify(&self, error: BoxError) -> CollaboratorError {
        if error.is::<Elapsed>() {
            return CollaboratorError::Timeout {
                collaborator: self.collaborator,
                after: self.policy.timeout(),
            };
        }
        match error.downcast::<CollaboratorError>() {
            Ok(error) => *error,
            Err(other) => CollaboratorError::failed(self.collaborator, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn flaky(
        failures: usize,
        attempts: Arc<AtomicUsize>,
    ) -> impl Fn(u32) -> Pin<Box<dyn Future<Output = Result<u32, CollaboratorError>> + Send>>
           + Clone
           + Send
           + Sync
           + 'static {
        move |request: u32| {
            let attempts = attempts.clone();
            Box::pin(async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < failures {
                    Err(CollaboratorError::failed("flaky", "boom"))
                } else {
                    Ok(request * 2)
                }
            })
        }
    }

    #[tokio::test]
    async fn retries_a_failure_exactly_once() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let call = GuardedCall::new("flaky", CallPolicy::new(1_000, true), 2, flaky(1, attempts.clone()));
        assert_eq!(call.call(21).await, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let attempts = Arc::new(AtomicUsize::new(0));
        let call = GuardedCall::new("flaky", CallPolicy::new(1_000, true), 2, flaky(5, attempts.clone()));
        let result = call.call(1).await;
        assert!(matches!(result, Err(CollaboratorError::Failed { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_retry_when_disabled() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let call = GuardedCall::new("flaky", CallPolicy::new(1_000, false), 2, flaky(1, attempts.clone()));
        assert!(call.call(1).await.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let call = GuardedCall::new("slow", CallPolicy::new(20, false), 1, |_: ()| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, CollaboratorError>(())
        });
        let result = call.call(()).await;
        assert_eq!(
            result,
            Err(CollaboratorError::Timeout {
                collaborator: "slow",
                after: Duration::from_millis(20)
            })
        );
    }

    #[tokio::test]
    async fn retry_runs_under_a_fresh_timeout() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        // each attempt takes 60ms against an 80ms deadline; a shared deadline would expire
        let call = GuardedCall::new("sluggish", CallPolicy::new(80, true), 1, move |_: ()| {
            let counter = counter.clone();
            async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(60)).await;
                if attempt == 0 {
                    Err(CollaboratorError::failed("sluggish", "first attempt fails"))
                } else {
                    Ok(7u8)
                }
            }
        });
        assert_eq!(call.call(()).await, Ok(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clones_share_the_concurrency_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current, max) = (in_flight.clone(), peak.clone());
        let call = GuardedCall::new("pool", CallPolicy::new(5_000, false), 2, move |_: usize| {
            let (current, max) = (current.clone(), max.clone());
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, CollaboratorError>(())
            }
        });

        let calls: Vec<_> = (0..8)
            .map(|i| {
                let call = call.clone();
                tokio::spawn(async move { call.call(i).await })
            })
            .collect();
        for handle in calls {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }
}
