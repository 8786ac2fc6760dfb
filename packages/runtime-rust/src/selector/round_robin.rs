//! Round-robin selection starting from a random offset, so that many
//! callers building generators at the same time do not all hit the first
//! route.

use rand::Rng;
use xmicro_core::constants::ROUND_ROBIN_SELECTOR;

use super::{Next, SelectOptions, Selector, SelectorError};

#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinSelector;

impl RoundRobinSelector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Selector for RoundRobinSelector {
    fn name(&self) -> &'static str {
        ROUND_ROBIN_SELECTOR
    }

    fn select(&self, routes: &[String], opts: &SelectOptions) -> Result<Next, SelectorError> {
        let routes = opts.apply(routes);
        if routes.is_empty() {
            return Err(SelectorError::NoneAvailable);
        }
        let mut cursor = rand::rng().random_range(0..routes.len());
        Ok(Box::new(move || {
            let pick = routes[cursor % routes.len()].clone();
            cursor = cursor.wrapping_add(1);
            pick
        }))
    }

    fn record(&self, _address: &str, _error: Option<&(dyn std::error::Error + 'static)>) {}

    fn reset(&self) {}
}
