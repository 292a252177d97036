//! Backoff strategies for retry scheduling and polling delays.
//!
//! This module provides two main backoff strategies:
//!
//! 1. Doubling
//! 2. Linear
//!
//! each of which can be optionally modified by applying different types of jitter.
//!
//! All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use dialqueue::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::doubling(TimeDelta::minutes(1))
//!     .with_max(TimeDelta::minutes(30));
//!
//! assert_eq!(strategy.backoff(1), TimeDelta::minutes(2));
//! assert_eq!(strategy.backoff(2), TimeDelta::minutes(4));
//! assert_eq!(strategy.backoff(4), TimeDelta::minutes(16));
//! assert_eq!(strategy.backoff(5), TimeDelta::minutes(30));
//! assert_eq!(strategy.backoff(12), TimeDelta::minutes(30));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given an attempt number returns the [`TimeDelta`] to wait before the
    /// next try.
    fn backoff(&self, attempt: u32) -> TimeDelta;
}

/// Doubling backoff strategy.
///
/// Doubles the base delay with each attempt. It is also possible, and
/// advisable, to set the maximum backoff using [`BackoffStrategy::with_max`].
///
/// __Note:__ This type cannot be constructed directly, instead
/// [`BackoffStrategy::doubling`] should be used.
///
/// # Example
///
/// ```
/// # use dialqueue::prelude::*;
/// # use chrono::TimeDelta;
///
/// let strategy =
///     BackoffStrategy::doubling(TimeDelta::seconds(1)).with_max(TimeDelta::seconds(30));
///
/// assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
/// assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
/// assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
/// assert_eq!(strategy.backoff(4), TimeDelta::seconds(16));
/// assert_eq!(strategy.backoff(5), TimeDelta::seconds(30));
/// assert_eq!(strategy.backoff(6), TimeDelta::seconds(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Doubling {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Doubling {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let mut seconds = 2_i64
            .checked_pow(attempt)
            .and_then(|factor| factor.checked_mul(self.base.num_seconds()))
            .unwrap_or(i64::MAX);
        if let Some(max) = self.max {
            seconds = seconds.min(max.num_seconds());
        }
        TimeDelta::seconds(seconds)
    }
}

/// Linear backoff strategy.
///
/// Grows linearly with each attempt. It is also possible to set the maximum
/// backoff using [`BackoffStrategy::with_max`].
///
/// __Note:__ This type cannot be constructed directly, instead
/// [`BackoffStrategy::linear`] should be used.
///
/// # Example
///
/// ```
/// # use dialqueue::prelude::*;
/// # use chrono::TimeDelta;
///
/// let strategy = BackoffStrategy::linear(TimeDelta::seconds(5)).with_max(TimeDelta::seconds(30));
///
/// assert_eq!(strategy.backoff(1), TimeDelta::seconds(5));
/// assert_eq!(strategy.backoff(2), TimeDelta::seconds(10));
/// assert_eq!(strategy.backoff(6), TimeDelta::seconds(30));
/// assert_eq!(strategy.backoff(7), TimeDelta::seconds(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    factor: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Linear {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let mut backoff = self.factor * attempt as i32;
        if let Some(max) = self.max {
            backoff = backoff.min(max);
        }
        backoff
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter to be added to the backoff in the range `-delta =< jitter =< delta`.
    Absolute(TimeDelta),
    /// A random jitter to be added as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        };
        let jitter_milliseconds = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value + TimeDelta::milliseconds(jitter_milliseconds)
    }
}

/// Backoff strategies for retry scheduling and polling delays.
///
/// This type provides two main backoff strategies:
///
/// 1. Doubling
/// 2. Linear
///
/// each of which can be optionally modified by applying different types of jitter.
///
/// All of the constructors and configuration functions are `const`.
///
/// # Example
///
/// ```
/// # use dialqueue::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy = BackoffStrategy::linear(TimeDelta::seconds(20))
///     .with_max(TimeDelta::seconds(60))
///     .with_jitter(Jitter::Absolute(TimeDelta::seconds(10)));
///
/// assert!(strategy.backoff(1) >= TimeDelta::seconds(10));
/// assert!(strategy.backoff(1) <= TimeDelta::seconds(30));
/// assert!(strategy.backoff(2) >= TimeDelta::seconds(30));
/// assert!(strategy.backoff(2) <= TimeDelta::seconds(50));
/// assert!(strategy.backoff(3) >= TimeDelta::seconds(50));
/// // Note the max here is the max plus max jitter
/// assert!(strategy.backoff(3) <= TimeDelta::seconds(70));
/// assert!(strategy.backoff(10) >= TimeDelta::seconds(50));
/// assert!(strategy.backoff(10) <= TimeDelta::seconds(70));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Doubling> {
    /// Creates a [`BackoffStrategy`] which doubles the base delay with each
    /// attempt.
    ///
    /// It is advisable to also set the maximum backoff using
    /// [`BackoffStrategy::with_max`].
    ///
    /// # Example
    ///
    /// ```
    /// # use dialqueue::prelude::*;
    /// # use chrono::TimeDelta;
    ///
    /// let strategy = BackoffStrategy::doubling(TimeDelta::minutes(1));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::minutes(2));
    /// assert_eq!(strategy.backoff(2), TimeDelta::minutes(4));
    /// assert_eq!(strategy.backoff(3), TimeDelta::minutes(8));
    /// ```
    pub const fn doubling(base: TimeDelta) -> Self {
        Self::new(Doubling { base, max: None })
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl BackoffStrategy<Linear> {
    /// Creates a [`BackoffStrategy`] with a linear backoff strategy.
    ///
    /// # Example
    ///
    /// ```
    /// # use dialqueue::prelude::*;
    /// # use chrono::TimeDelta;
    ///
    /// let strategy = BackoffStrategy::linear(TimeDelta::seconds(5));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::seconds(5));
    /// assert_eq!(strategy.backoff(2), TimeDelta::seconds(10));
    /// assert_eq!(strategy.backoff(3), TimeDelta::seconds(15));
    /// ```
    pub const fn linear(factor: TimeDelta) -> Self {
        Self::new(Linear { factor, max: None })
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    /// Creates a [`BackoffStrategy`] with the given backoff strategy.
    ///
    /// Generally this function will only be used if you have implemented your
    /// own custom [`Strategy`]. More commonly [`BackoffStrategy`] is
    /// constructed via the strategy specific constructor functions:
    ///
    /// - [`BackoffStrategy::doubling`]
    /// - [`BackoffStrategy::linear`]
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Add a jitter to the backoff strategy see [`Jitter`] for more information about how this
    /// affects the strategy.
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Add a minimum value. This can be useful when you have a particularly large jitter and would
    /// like to avoid a delay of less than a given amount.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let mut backoff = self.strategy.backoff(attempt);

        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff);
        }

        backoff.max(self.min)
    }
}

impl Default for BackoffStrategy<Doubling> {
    /// The stock retry policy: a one minute delay doubled with each attempt
    /// and capped at thirty minutes.
    fn default() -> Self {
        Self::doubling(TimeDelta::minutes(1)).with_max(TimeDelta::minutes(30))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn doubling_backoff() {
        let strategy = BackoffStrategy::doubling(TimeDelta::minutes(1));

        for attempt in 1..10 {
            assert_eq!(
                strategy.backoff(attempt),
                TimeDelta::minutes(2_i64.pow(attempt))
            );
        }
    }

    #[test]
    fn doubling_backoff_with_max() {
        let strategy =
            BackoffStrategy::doubling(TimeDelta::minutes(1)).with_max(TimeDelta::minutes(30));

        let delays: Vec<_> = (1..=7)
            .map(|attempt| strategy.backoff(attempt).num_minutes())
            .collect();

        assert_eq!(delays, [2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn doubling_backoff_does_not_overflow_on_large_attempts() {
        let strategy =
            BackoffStrategy::doubling(TimeDelta::minutes(1)).with_max(TimeDelta::minutes(30));

        assert_eq!(strategy.backoff(200), TimeDelta::minutes(30));
    }

    #[test]
    fn doubling_backoff_with_absolute_jitter() {
        let jitter = TimeDelta::seconds(10);
        let strategy = BackoffStrategy::doubling(TimeDelta::minutes(1))
            .with_max(TimeDelta::minutes(30))
            .with_jitter(Jitter::Absolute(jitter));

        for attempt in 1..5 {
            let expected = TimeDelta::minutes(2_i64.pow(attempt));
            let backoff = strategy.backoff(attempt);
            assert!(backoff >= expected - jitter);
            assert!(backoff <= expected + jitter);
        }
    }

    #[test]
    fn linear_backoff() {
        let factor = TimeDelta::seconds(5);
        let strategy = BackoffStrategy::linear(factor);

        for attempt in 1..100 {
            assert_eq!(strategy.backoff(attempt), factor * attempt as i32);
        }
    }

    #[test]
    fn linear_backoff_with_max() {
        let strategy =
            BackoffStrategy::linear(TimeDelta::seconds(5)).with_max(TimeDelta::seconds(30));

        let delays: Vec<_> = (1..=8)
            .map(|attempt| strategy.backoff(attempt).num_seconds())
            .collect();

        assert_eq!(delays, [5, 10, 15, 20, 25, 30, 30, 30]);
    }

    #[test]
    fn linear_backoff_with_relative_jitter() {
        let factor = TimeDelta::minutes(1);
        let strategy = BackoffStrategy::linear(factor).with_jitter(Jitter::Relative(0.1));

        for attempt in 1..100 {
            let expected = factor * attempt as i32;
            let jitter = TimeDelta::seconds(6) * attempt as i32;
            let backoff = strategy.backoff(attempt);
            assert!(backoff >= expected - jitter);
            assert!(backoff <= expected + jitter);
        }
    }

    #[test]
    fn jitter_respects_min() {
        let min = TimeDelta::seconds(5);
        let strategy = BackoffStrategy::linear(TimeDelta::seconds(10))
            .with_jitter(Jitter::Absolute(TimeDelta::seconds(20)))
            .with_min(min);

        for attempt in 1..100 {
            assert!(strategy.backoff(attempt) >= min);
        }
    }

    #[test]
    fn default_policy_doubles_from_two_minutes() {
        let strategy = BackoffStrategy::default();

        assert_eq!(strategy.backoff(1), TimeDelta::minutes(2));
        assert_eq!(strategy.backoff(4), TimeDelta::minutes(16));
        assert_eq!(strategy.backoff(5), TimeDelta::minutes(30));
        assert_eq!(strategy.backoff(6), TimeDelta::minutes(30));
    }
}
