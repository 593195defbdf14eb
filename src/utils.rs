use std::sync::atomic::{AtomicU64, Ordering};

use glam::DVec3;

pub fn contains(box_size: DVec3, pos: DVec3) -> bool {
    let mut contains = true;
    for i in 0..3 {
        contains &= pos[i] >= 0. && pos[i] < box_size[i];
    }
    contains
}

pub fn box_wrap(box_size: DVec3, pos: &mut DVec3) {
    for i in 0..3 {
        while pos[i] < 0. {
            pos[i] += box_size[i];
        }
        while pos[i] >= box_size[i] {
            pos[i] -= box_size[i];
        }
    }
}

/// Shortest periodic image of the separation `dx` in a box of size `box_size`.
pub fn nearest_image(mut dx: DVec3, box_size: DVec3) -> DVec3 {
    for i in 0..3 {
        if dx[i] > 0.5 * box_size[i] {
            dx[i] -= box_size[i];
        } else if dx[i] < -0.5 * box_size[i] {
            dx[i] += box_size[i];
        }
    }
    dx
}

/// An `f64` that can be shared between threads and updated with
/// compare-exchange loops.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release)
    }

    /// Raise the stored value to `value` if it is larger.
    pub fn fetch_max(&self, value: f64) -> f64 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if f64::from_bits(current) >= value {
                return f64::from_bits(current);
            }
            match self.0.compare_exchange_weak(
                current,
                value.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(old) => return f64::from_bits(old),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Clone for AtomicF64 {
    fn clone(&self) -> Self {
        Self::new(self.load())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn test_box_wrap() {
        let box_size = DVec3::ONE;
        let mut pos = DVec3::new(-0.25, 1.5, 0.5);
        box_wrap(box_size, &mut pos);
        assert_approx_eq!(f64, pos.x, 0.75);
        assert_approx_eq!(f64, pos.y, 0.5);
        assert!(contains(box_size, pos));
    }

    #[test]
    fn test_atomic_max() {
        let value = AtomicF64::new(1.);
        value.fetch_max(0.5);
        assert_approx_eq!(f64, value.load(), 1.);
        value.fetch_max(2.5);
        assert_approx_eq!(f64, value.load(), 2.5);
    }
}
