use rand::Rng;
#[cfg(test)] use std::sync::Mutex;

#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random {
    /// uniformly distributed in (0.0, 1.0]
    fn next_unit() -> f64;
    fn next_u16() -> u16;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn next_unit() -> f64 {
        // gen() is in [0.0, 1.0)
        1.0 - rand::thread_rng().gen::<f64>()
    }

    fn next_u16() -> u16 {
        rand::thread_rng().gen()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_unit_range() {
        for _ in 0..1000 {
            let u = RngRandom::next_unit();
            assert!(u > 0.0 && u <= 1.0);
        }
    }
}
