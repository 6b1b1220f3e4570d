use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::CollaboratorError;

/// Something the pipeline can ask for a result: a detector, a ranking leg, a scorer.
#[async_trait]
pub trait Capability<Req>: Send + Sync
where
    Req: Sync,
{
    type Output: Send;

    fn name(&self) -> &'static str;

    async fn invoke(&self, request: &Req) -> Result<Self::Output, CollaboratorError>;

    /// Whether an output is worth keeping. An unactionable output sends a
    /// fallback chain on to its second capability.
    fn is_actionable(&self, _output: &Self::Output) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Primary,
    Fallback,
}

#[derive(Debug)]
pub struct ChainOutcome<T> {
    /// Output of whichever tier answered last
    pub result: Result<T, CollaboratorError>,
    pub served_by: Tier,
    /// Why the primary was passed over, if it failed outright
    pub primary_error: Option<CollaboratorError>,
}

/// Cheap capability first; the second one is only consulted when the first
/// fails or comes back unactionable.
pub struct FallbackChain<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> FallbackChain<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }

    pub fn fallback(&self) -> &F {
        &self.fallback
    }

    pub async fn run<Req, T>(&self, request: &Req) -> ChainOutcome<T>
    where
        Req: Sync,
        P: Capability<Req, Output = T>,
        F: Capability<Req, Output = T>,
        T: Send,
    {
        let primary_error = match self.primary.invoke(request).await {
            Ok(output) if self.primary.is_actionable(&output) => {
                debug!("{} served the request", self.primary.name());
                return ChainOutcome {
                    result: Ok(output),
                    served_by: Tier::Primary,
                    primary_error: None,
                };
            }
            Ok(_) => {
                debug!(
                    "{} returned nothing actionable, trying {}",
                    self.primary.name(),
                    self.fallback.name()
                );
                None
            }
            Err(e) => {
                warn!(
                    "{} failed, trying {}: {}",
                    self.primary.name(),
                    self.fallback.name(),
                    e
                );
                Some(e)
            }
        };

        ChainOutcome {
            result: self.fallback.invoke(request).await,
            served_by: Tier::Fallback,
            primary_error,
        }
    }
}

/// Outputs of two capabilities queried side by side where either may fail alone.
#[derive(Debug)]
pub struct Tolerant<A, B> {
    pub left: Option<A>,
    pub right: Option<B>,
    pub errors: Vec<CollaboratorError>,
}

/// Runs both capabilities concurrently and keeps whatever survives.
/// Fails only when both do.
pub async fn join_tolerant<Req, L, R>(
    left: &L,
    right: &R,
    request: &Req,
) -> Result<Tolerant<L::Output, R::Output>, Vec<CollaboratorError>>
where
    Req: Sync,
    L: Capability<Req>,
    R: Capability<Req>,
{
    let (left_result, right_result) = tokio::join!(left.invoke(request), right.invoke(request));

    match (left_result, right_result) {
        (Ok(l), Ok(r)) => Ok(Tolerant {
            left: Some(l),
            right: Some(r),
            errors: Vec::new(),
        }),
        (Ok(l), Err(e)) => {
            warn!("{} failed, continuing with {} only: {}", right.name(), left.name(), e);
            Ok(Tolerant {
                left: Some(l),
                right: None,
                errors: vec![e],
            })
        }
        (Err(e), Ok(r)) => {
            warn!("{} failed, continuing with {} only: {}", left.name(), right.name(), e);
            Ok(Tolerant {
                left: None,
                right: Some(r),
                errors: vec![e],
            })
        }
        (Err(l), Err(r)) => Err(vec![l, r]),
    }
}
