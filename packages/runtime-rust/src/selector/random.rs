//! Uniform random selection. Stateless: `record` and `reset` do nothing.

use rand::Rng;
use xmicro_core::constants::RANDOM_SELECTOR;

use super::{Next, SelectOptions, Selector, SelectorError};

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl RandomSelector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Selector for RandomSelector {
    fn name(&self) -> &'static str {
        RANDOM_SELECTOR
    }

    fn select(&self, routes: &[String], opts: &SelectOptions) -> Result<Next, SelectorError> {
        let routes = opts.apply(routes);
        match routes.as_slice() {
            [] => Err(SelectorError::NoneAvailable),
            // No RNG needed for a single route.
            [only] => {
                let only = only.clone();
                Ok(Box::new(move || only.clone()))
            }
            _ => Ok(Box::new(move || {
                let idx = rand::rng().random_range(0..routes.len());
                routes[idx].clone()
            })),
        }
    }

    fn record(&self, _address: &str, _error: Option<&(dyn std::error::Error + 'static)>) {}

    fn reset(&self) {}
}
