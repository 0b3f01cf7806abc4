//! Ordered fallback chains of named strategies.
//!
//! A chain tries each strategy in turn and returns the first success. Every
//! failure along the way is kept so the caller can record it and decide how
//! the overall failure should be classified.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::PipelineError;

#[async_trait]
pub trait Strategy<I, O>: Send + Sync
where
    I: ?Sized + Sync,
    O: Send,
{
    fn name(&self) -> &str;

    async fn attempt(&self, input: &I) -> Result<O, PipelineError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyFailure {
    pub strategy: String,
    pub error: PipelineError,
}

impl std::fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.strategy, self.error)
    }
}

#[derive(Debug)]
pub struct ChainOutcome<O> {
    pub value: O,
    /// Name of the strategy that succeeded
    pub strategy: String,
    /// Strategies that failed before it
    pub failures: Vec<StrategyFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainExhausted {
    pub failures: Vec<StrategyFailure>,
}

impl ChainExhausted {
    pub fn all_degraded(&self) -> bool {
        !self.failures.is_empty()
            && self
                .failures
                .iter()
                .all(|f| matches!(f.error, PipelineError::Degraded(_)))
    }

    pub fn any_transient(&self) -> bool {
        self.failures.iter().any(|f| f.error.is_transient())
    }

    pub fn messages(&self) -> Vec<String> {
        self.failures.iter().map(ToString::to_string).collect()
    }

    /// Collapse the failures into one error.
    ///
    /// A fatal failure wins, then any transient one (so the job is retried),
    /// then all-degraded; everything else is a stage error.
    pub fn into_error(self, what: &str) -> PipelineError {
        if let Some(fatal) = self
            .failures
            .iter()
            .find(|f| matches!(f.error, PipelineError::Fatal(_)))
        {
            return fatal.error.clone();
        }

        let detail = if self.failures.is_empty() {
            "no strategies configured".to_string()
        } else {
            self.messages().join("; ")
        };
        let message = format!("{} failed: {}", what, detail);

        if self.any_transient() {
            PipelineError::Transient(message)
        } else if self.all_degraded() {
            PipelineError::Degraded(message)
        } else {
            PipelineError::Stage(message)
        }
    }
}

pub struct FallbackChain<I: ?Sized + Sync, O: Send> {
    strategies: Vec<Box<dyn Strategy<I, O>>>,
}

impl<I: ?Sized + Sync, O: Send> Default for FallbackChain<I, O> {
    fn default() -> Self {
        Self { strategies: Vec::new() }
    }
}

impl<I: ?Sized + Sync, O: Send> FallbackChain<I, O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, strategy: impl Strategy<I, O> + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn push_boxed(mut self, strategy: Box<dyn Strategy<I, O>>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Run strategies in order until one succeeds. A fatal error stops the
    /// chain immediately.
    pub async fn run(&self, input: &I) -> Result<ChainOutcome<O>, ChainExhausted> {
        let mut failures = Vec::new();

        for strategy in &self.strategies {
            match strategy.attempt(input).await {
                Ok(value) => {
                    debug!(strategy = strategy.name(), fallbacks = failures.len(), "Strategy succeeded");
                    return Ok(ChainOutcome {
                        value,
                        strategy: strategy.name().to_string(),
                        failures,
                    });
                }
                Err(error) => {
                    warn!(strategy = strategy.name(), error = %error, "Strategy failed");
                    let fatal = matches!(error, PipelineError::Fatal(_));
                    failures.push(StrategyFailure {
                        strategy: strategy.name().to_string(),
                        error,
                    });
                    if fatal {
                        break;
                    }
                }
            }
        }

        Err(ChainExhausted { failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        result: Result<u32, PipelineError>,
    }

    #[async_trait]
    impl Strategy<str, u32> for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn attempt(&self, _input: &str) -> Result<u32, PipelineError> {
            self.result.clone()
        }
    }

    fn fixed(name: &'static str, result: Result<u32, PipelineError>) -> Fixed {
        Fixed { name, result }
    }

    #[tokio::test]
    async fn first_success_wins_and_failures_are_kept() {
        let chain = FallbackChain::new()
            .push(fixed("primary", Err(PipelineError::Stage("boom".into()))))
            .push(fixed("secondary", Ok(7)))
            .push(fixed("tertiary", Ok(9)));

        let outcome = chain.run("doc").await.unwrap();
        assert_eq!(outcome.value, 7);
        assert_eq!(outcome.strategy, "secondary");
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].strategy, "primary");
    }

    #[tokio::test]
    async fn fatal_error_stops_the_chain() {
        let chain = FallbackChain::new()
            .push(fixed("primary", Err(PipelineError::Fatal("corrupt".into()))))
            .push(fixed("secondary", Ok(1)));

        let exhausted = chain.run("doc").await.unwrap_err();
        assert_eq!(exhausted.failures.len(), 1);
        assert_eq!(
            exhausted.into_error("extraction"),
            PipelineError::Fatal("corrupt".into())
        );
    }

    #[tokio::test]
    async fn exhausted_chain_classification() {
        let chain = FallbackChain::new()
            .push(fixed("a", Err(PipelineError::Transient("quota".into()))))
            .push(fixed("b", Err(PipelineError::Stage("parse".into()))));
        let err = chain.run("doc").await.unwrap_err().into_error("interpretation");
        assert!(err.is_transient());

        let chain = FallbackChain::new()
            .push(fixed("a", Err(PipelineError::Degraded("empty".into()))))
            .push(fixed("b", Err(PipelineError::Degraded("empty".into()))));
        let exhausted = chain.run("doc").await.unwrap_err();
        assert!(exhausted.all_degraded());
        assert!(matches!(exhausted.into_error("extraction"), PipelineError::Degraded(_)));
    }

    #[tokio::test]
    async fn empty_chain_is_exhausted() {
        let chain: FallbackChain<str, u32> = FallbackChain::new();
        let exhausted = chain.run("doc").await.unwrap_err();
        assert!(!exhausted.all_degraded());
        assert!(matches!(exhausted.into_error("classification"), PipelineError::Stage(_)));
    }
}
