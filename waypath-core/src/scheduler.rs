//! Route choice between direct queues and distance-vector paths, and the
//! randomized delays used by periodic tasks.

use std::time::Duration;

use rand::{Rng, RngCore};

/// How a control message may be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteOptions {
    /// DV paths may be used.
    pub dv_allowed: bool,
    /// Queues and paths not (yet) validated may be used.
    pub unconfirmed_allowed: bool,
    /// Send over up to two routes at once.
    pub redundant: bool,
}

impl RouteOptions {
    pub const ANYTHING_GOES: RouteOptions = RouteOptions {
        dv_allowed: true,
        unconfirmed_allowed: true,
        redundant: false,
    };

    /// Same options, but send over two routes when there are two.
    pub const fn redundant(self) -> RouteOptions {
        RouteOptions {
            redundant: true,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    DistanceVector,
}

/// Picks between a direct and a DV route when both are eligible and
/// redundancy was not asked for.
pub trait RoutePolicy {
    fn choose(&mut self, rng: &mut dyn RngCore) -> Route;
}

/// Uniform coin flip per transmission; spreads load over both routes.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoinFlip;

impl RoutePolicy for CoinFlip {
    fn choose(&mut self, rng: &mut dyn RngCore) -> Route {
        if rng.gen_bool(0.5) {
            Route::Direct
        } else {
            Route::DistanceVector
        }
    }
}

/// Always the same route.
#[derive(Debug, Clone, Copy)]
pub struct Fixed(pub Route);

impl RoutePolicy for Fixed {
    fn choose(&mut self, _rng: &mut dyn RngCore) -> Route {
        self.0
    }
}

/// Uniform in `[d/2, 3d/2]`.
pub fn randomize(d: Duration, rng: &mut dyn RngCore) -> Duration {
    let half = d / 2;
    if half.is_zero() {
        return d;
    }
    let jitter = rng.gen_range(0..=d.as_micros().min(u64::MAX as u128) as u64);
    half + Duration::from_micros(jitter)
}

/// Next retry delay: doubled with jitter, never below `floor` nor above `cap`.
pub fn backoff(previous: Duration, floor: Duration, cap: Duration, rng: &mut dyn RngCore) -> Duration {
    let base = if previous.is_zero() {
        floor
    } else {
        previous.saturating_mul(2)
    };
    randomize(base, rng).clamp(floor, cap.max(floor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn coin_flip_uses_both_routes() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut p = CoinFlip;
        let direct = (0..1000)
            .filter(|_| p.choose(&mut rng) == Route::Direct)
            .count();
        assert!(direct > 350 && direct < 650, "direct = {direct}");
    }

    #[test]
    fn randomize_stays_in_band() {
        let mut rng = StdRng::seed_from_u64(1);
        let d = Duration::from_secs(60);
        for _ in 0..200 {
            let r = randomize(d, &mut rng);
            assert!(r >= Duration::from_secs(30) && r <= Duration::from_secs(90));
        }
    }

    #[test]
    fn backoff_grows_until_cap() {
        let mut rng = StdRng::seed_from_u64(3);
        let floor = Duration::from_secs(60);
        let cap = Duration::from_secs(600);
        let mut d = Duration::ZERO;
        for _ in 0..20 {
            d = backoff(d, floor, cap, &mut rng);
            assert!(d >= floor && d <= cap);
        }
        assert!(d > Duration::from_secs(200));
    }
}
