//! Placement Rate Limiter
//!
//! Each identity holds a point balance. An accepted placement costs one
//! point; at zero the identity is in cooldown until its regeneration
//! instant passes.
//!
//! Two regeneration curves are supported:
//! - `FullRefill`: the balance jumps back to `max_points` once the cooldown
//!   that started at zero has elapsed.
//! - `Incremental`: one point per `cooldown` interval while below the
//!   maximum; every consumption restarts the interval.
//!
//! All methods take `now` explicitly so the state machine is testable
//! without sleeping.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::core::identity::Identity;

/// Longest cooldown the limiter will schedule. Longer configured values are
/// clamped so every regeneration instant stays representable.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Regeneration curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegenPolicy {
    /// Refill to the maximum when the cooldown expires.
    #[default]
    FullRefill,
    /// Add one point per cooldown interval.
    Incremental,
}

/// Rate limit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Balance of a fresh identity, and the regeneration ceiling.
    pub max_points: u32,
    /// Cooldown length (full refill) or per-point interval (incremental).
    pub cooldown: Duration,
    /// Regeneration curve.
    pub policy: RegenPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_points: crate::DEFAULT_MAX_POINTS,
            cooldown: Duration::from_secs(crate::DEFAULT_COOLDOWN_SECS),
            policy: RegenPolicy::FullRefill,
        }
    }
}

/// Balance of one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterState {
    /// Remaining points, `0..=max_points`.
    pub points: u32,
    /// Next regeneration instant, if one is scheduled.
    pub cooldown_until: Option<Instant>,
}

impl RateLimiterState {
    fn fresh(max_points: u32) -> Self {
        Self {
            points: max_points,
            cooldown_until: None,
        }
    }

    /// Whether the identity is out of points.
    pub fn in_cooldown(&self) -> bool {
        self.points == 0
    }
}

/// Result of a consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Point spent.
    Accepted {
        /// Balance after the spend.
        points: u32,
        /// Set when this spend emptied the balance: time until points return.
        cooldown: Option<Duration>,
    },
    /// No points; try again after `wait`.
    Rejected {
        /// Time until the next regeneration.
        wait: Duration,
    },
}

impl ConsumeOutcome {
    /// Whether the point was spent.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Per-identity point balances.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    states: BTreeMap<Identity, RateLimiterState>,
}

impl RateLimiter {
    /// Create a limiter with no tracked identities.
    ///
    /// The cooldown is clamped to [`MAX_COOLDOWN`].
    pub fn new(mut config: RateLimitConfig) -> Self {
        config.cooldown = config.cooldown.min(MAX_COOLDOWN);
        Self {
            config,
            states: BTreeMap::new(),
        }
    }

    /// Limiter configuration.
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Try to spend one point for `identity`.
    pub fn try_consume(&mut self, identity: &Identity, now: Instant) -> ConsumeOutcome {
        let config = self.config;
        let state = self
            .states
            .entry(identity.clone())
            .or_insert_with(|| RateLimiterState::fresh(config.max_points));

        Self::regenerate_state(&config, state, now);

        if state.points == 0 {
            let until = *state.cooldown_until.get_or_insert(now + config.cooldown);
            return ConsumeOutcome::Rejected {
                wait: until.saturating_duration_since(now),
            };
        }

        state.points -= 1;

        let cooldown = match config.policy {
            RegenPolicy::FullRefill => {
                if state.points == 0 {
                    state.cooldown_until = Some(now + config.cooldown);
                    Some(config.cooldown)
                } else {
                    None
                }
            }
            RegenPolicy::Incremental => {
                state.cooldown_until = Some(now + config.cooldown);
                (state.points == 0).then_some(config.cooldown)
            }
        };

        ConsumeOutcome::Accepted {
            points: state.points,
            cooldown,
        }
    }

    /// Current balance, applying any regeneration that is due.
    ///
    /// Unknown identities start tracking at the maximum.
    pub fn points(&mut self, identity: &Identity, now: Instant) -> u32 {
        let config = self.config;
        let state = self
            .states
            .entry(identity.clone())
            .or_insert_with(|| RateLimiterState::fresh(config.max_points));
        Self::regenerate_state(&config, state, now);
        state.points
    }

    /// Read an identity's state without advancing it.
    pub fn state(&self, identity: &Identity) -> Option<RateLimiterState> {
        self.states.get(identity).copied()
    }

    /// Periodic tick: regenerate every identity whose instant has passed.
    ///
    /// Returns the identities whose balance changed, with the new balance.
    pub fn regenerate(&mut self, now: Instant) -> Vec<(Identity, u32)> {
        let config = self.config;
        self.states
            .iter_mut()
            .filter_map(|(identity, state)| {
                Self::regenerate_state(&config, state, now).then(|| (identity.clone(), state.points))
            })
            .collect()
    }

    /// Number of tracked identities.
    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    /// Apply due regeneration to one state. Returns true if points changed.
    fn regenerate_state(config: &RateLimitConfig, state: &mut RateLimiterState, now: Instant) -> bool {
        let until = match state.cooldown_until {
            Some(until) if now >= until => until,
            _ => return false,
        };

        if state.points >= config.max_points {
            state.cooldown_until = None;
            return false;
        }

        let before = state.points;
        match config.policy {
            RegenPolicy::FullRefill => {
                state.points = config.max_points;
                state.cooldown_until = None;
            }
            RegenPolicy::Incremental => {
                let interval = config.cooldown;
                if interval.is_zero() {
                    state.points = config.max_points;
                    state.cooldown_until = None;
                } else {
                    // Catch up on every interval that elapsed since `until`.
                    let missing = config.max_points - state.points;
                    let elapsed = now.duration_since(until).as_nanos() / interval.as_nanos();
                    let steps = (elapsed + 1).min(u128::from(missing)) as u32;
                    state.points += steps;
                    state.cooldown_until = if state.points >= config.max_points {
                        None
                    } else {
                        interval
                            .checked_mul(steps)
                            .and_then(|advance| until.checked_add(advance))
                    };
                }
            }
        }

        state.points != before
    }
}
