use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared request-unit accumulator.
///
/// Clones observe the same total. Stored as `f64` bits so concurrent page fetches
/// can add without a lock.
#[derive(Debug, Clone, Default)]
pub struct ChargeMeter {
    bits: Arc<AtomicU64>,
}

impl ChargeMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, charge: f64) {
        if charge <= 0.0 || !charge.is_finite() {
            return;
        }
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + charge).to_bits();
            match self
                .bits
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn total(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates() {
        let meter = ChargeMeter::new();
        meter.add(1.5);
        meter.clone().add(2.25);
        assert_eq!(meter.total(), 3.75);
    }

    #[test]
    fn test_ignores_negative_and_nan() {
        let meter = ChargeMeter::new();
        meter.add(-1.0);
        meter.add(f64::NAN);
        assert_eq!(meter.total(), 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds() {
        let meter = ChargeMeter::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = meter.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    m.add(0.5);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(meter.total(), 400.0);
    }
}
