//! Timeline configuration.

/// Configuration for a room timeline and its writers.
#[derive(Debug, Clone)]
pub struct TimelineConfig {
    /// User id of the local user; decides the `me` flag on annotations.
    pub own_user_id: String,

    /// Capacity of the per-room member lookup cache.
    pub member_cache_capacity: usize,

    /// Number of events `Timeline::load` reads from the end of the log.
    pub initial_load_amount: usize,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            own_user_id: String::new(),
            member_cache_capacity: 5,
            initial_load_amount: 30,
        }
    }
}

impl TimelineConfig {
    /// Creates a configuration for `own_user_id` with default values.
    #[must_use]
    pub fn new(own_user_id: impl Into<String>) -> Self {
        Self {
            own_user_id: own_user_id.into(),
            ..Self::default()
        }
    }

    /// Sets the member cache capacity.
    #[must_use]
    pub const fn member_cache_capacity(mut self, capacity: usize) -> Self {
        self.member_cache_capacity = capacity;
        self
    }

    /// Sets the initial load window.
    #[must_use]
    pub const fn initial_load_amount(mut self, amount: usize) -> Self {
        self.initial_load_amount = amount;
        self
    }
}
