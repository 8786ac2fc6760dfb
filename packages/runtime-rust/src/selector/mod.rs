//! Load-balancing contract over a pool of address strings.
//!
//! A [`Selector`] turns a route snapshot into a [`Next`] generator. The
//! generator is infinite and bound to the snapshot it was built from; take a
//! new one when membership changes. [`Selector::record`] feeds call outcomes
//! back so stateful strategies can adapt.

pub mod random;
pub mod round_robin;

use std::fmt;
use std::sync::Arc;

use xmicro_core::constants::{RANDOM_SELECTOR, ROUND_ROBIN_SELECTOR};

pub use random::RandomSelector;
pub use round_robin::RoundRobinSelector;

/// Infinite generator of addresses drawn from one route snapshot.
pub type Next = Box<dyn FnMut() -> String + Send>;

/// Keeps a route when it returns `true`.
pub type Filter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("none available")]
    NoneAvailable,
    #[error("unknown selector strategy {0:?}")]
    UnknownStrategy(String),
}

/// Per-call selection options.
#[derive(Clone, Default)]
pub struct SelectOptions {
    pub filters: Vec<Filter>,
}

impl SelectOptions {
    #[must_use]
    pub fn with_filter(mut self, filter: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Routes passing every filter, in input order.
    #[must_use]
    pub fn apply(&self, routes: &[String]) -> Vec<String> {
        routes
            .iter()
            .filter(|route| self.filters.iter().all(|keep| keep(route)))
            .cloned()
            .collect()
    }
}

impl fmt::Debug for SelectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectOptions")
            .field("filters", &self.filters.len())
            .finish()
    }
}

pub trait Selector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Builds a generator over `routes` after applying `opts` filters.
    ///
    /// # Errors
    ///
    /// Returns [`SelectorError::NoneAvailable`] when no route survives.
    fn select(&self, routes: &[String], opts: &SelectOptions) -> Result<Next, SelectorError>;

    /// Reports the outcome of a call made to `address`.
    fn record(&self, address: &str, error: Option<&(dyn std::error::Error + 'static)>);

    /// Drops any state accumulated through [`record`](Selector::record).
    fn reset(&self);
}

/// Builds the strategy registered under `name` (`"random"` or `"roundrobin"`).
///
/// # Errors
///
/// Returns [`SelectorError::UnknownStrategy`] for any other name.
pub fn new_selector(name: &str) -> Result<Arc<dyn Selector>, SelectorError> {
    match name {
        RANDOM_SELECTOR => Ok(Arc::new(RandomSelector::new())),
        ROUND_ROBIN_SELECTOR => Ok(Arc::new(RoundRobinSelector::new())),
        other => Err(SelectorError::UnknownStrategy(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routes(addrs: &[&str]) -> Vec<String> {
        addrs.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn filters_are_conjunctive_and_keep_order() {
        let opts = SelectOptions::default()
            .with_filter(|r| r.starts_with("10."))
            .with_filter(|r| r.ends_with(":80"));
        let kept = opts.apply(&routes(&["10.0.0.1:80", "10.0.0.2:81", "192.168.0.1:80", "10.0.0.3:80"]));
        assert_eq!(kept, routes(&["10.0.0.1:80", "10.0.0.3:80"]));
    }

    #[test]
    fn strategies_resolve_by_name() {
        assert_eq!(new_selector("random").unwrap().name(), RANDOM_SELECTOR);
        assert_eq!(new_selector("roundrobin").unwrap().name(), ROUND_ROBIN_SELECTOR);
        assert!(matches!(
            new_selector("weighted"),
            Err(SelectorError::UnknownStrategy(name)) if name == "weighted"
        ));
    }

    #[test]
    fn everything_filtered_out_is_none_available() {
        let selector = new_selector("random").unwrap();
        let opts = SelectOptions::default().with_filter(|_| false);
        assert!(matches!(
            selector.select(&routes(&["a:1"]), &opts),
            Err(SelectorError::NoneAvailable)
        ));
    }
}
