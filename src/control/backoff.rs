use std::time::Duration;

use crate::util::random::Random;

/// The delay before the next round of Announce messages: `interval + (1 - X) * scale`, where
///  `X = -ln(U) / lambda` for `U` uniform in (0, 1]. Values of X above 1 are drawn again, so the
///  random part is between 0 and `scale`, mostly close to `scale`. Hosts that are started at the
///  same time drift apart this way.
pub fn backoff_delay<R: Random>(interval: Duration, scale: Duration, lambda: f64) -> Duration {
    let x = loop {
        let x = -R::next_unit().ln() / lambda;
        if (0.0..=1.0).contains(&x) {
            break x;
        }
    };
    interval + scale.mul_f64(1.0 - x)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use rstest::rstest;
    use crate::util::random::{MockRandom, RngRandom, MOCK_RANDOM_MUTEX};
    use super::*;

    #[rstest]
    #[case::u_one(1.0, 13.0)]
    #[case::x_mostly((-2.0f64).exp(), 5.0)]
    #[case::x_half((-1.25f64).exp(), 8.0)]
    fn test_backoff_delay(#[case] u: f64, #[case] expected_secs: f64) {
        let _lock = MOCK_RANDOM_MUTEX.lock();

        let ctx = MockRandom::next_unit_context();
        ctx.expect()
            .returning(move || u);

        let delay = backoff_delay::<MockRandom>(Duration::from_secs(3), Duration::from_secs(10), 2.5);
        assert!((delay.as_secs_f64() - expected_secs).abs() < 1e-6, "{:?}", delay);
    }

    #[test]
    fn test_backoff_redraws_large_x() {
        let _lock = MOCK_RANDOM_MUTEX.lock();

        let num_calls = Arc::new(AtomicUsize::new(0));
        let counter = num_calls.clone();
        let ctx = MockRandom::next_unit_context();
        ctx.expect()
            .returning(move || {
                // the first draw yields X = 4
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 => (-10.0f64).exp(),
                    _ => 1.0,
                }
            });

        let delay = backoff_delay::<MockRandom>(Duration::from_secs(3), Duration::from_secs(10), 2.5);
        assert_eq!(num_calls.load(Ordering::SeqCst), 2);
        assert!((delay.as_secs_f64() - 13.0).abs() < 1e-6);
    }

    #[test]
    fn test_backoff_range() {
        for _ in 0..1000 {
            let delay = backoff_delay::<RngRandom>(Duration::from_secs(3), Duration::from_secs(10), 2.5);
            assert!(delay >= Duration::from_secs(3));
            assert!(delay <= Duration::from_secs(13));
        }
    }
}
