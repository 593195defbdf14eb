use std::f64::consts::PI;

/// Smoothing kernels with compact support `h`, normalised in 3D.
pub trait Kernel {
    fn kernel(&self, r: f64, h: f64) -> f64;

    /// Derivative of the kernel with respect to `r`.
    fn derivative(&self, r: f64, h: f64) -> f64;

    fn q(r: f64, h: f64) -> f64 {
        r / h
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CubicSpline;

impl Kernel for CubicSpline {
    fn kernel(&self, r: f64, h: f64) -> f64 {
        let q = Self::q(r, h);
        let norm = 8. / (PI * h.powi(3));
        if q >= 1. {
            0.
        } else if q > 0.5 {
            norm * 2. * (1. - q).powi(3)
        } else {
            norm * (1. - 6. * q * q + 6. * q.powi(3))
        }
    }

    fn derivative(&self, r: f64, h: f64) -> f64 {
        let q = Self::q(r, h);
        let norm = 8. / (PI * h.powi(4));
        if q >= 1. {
            0.
        } else if q > 0.5 {
            -norm * 6. * (1. - q).powi(2)
        } else {
            norm * (-12. * q + 18. * q * q)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WendlandC2;

impl Kernel for WendlandC2 {
    fn kernel(&self, r: f64, h: f64) -> f64 {
        let q = Self::q(r, h);
        if q >= 1. {
            0.
        } else {
            21. / (2. * PI * h.powi(3)) * (1. - q).powi(4) * (1. + 4. * q)
        }
    }

    fn derivative(&self, r: f64, h: f64) -> f64 {
        let q = Self::q(r, h);
        if q >= 1. {
            0.
        } else {
            -21. / (2. * PI * h.powi(4)) * 20. * q * (1. - q).powi(3)
        }
    }
}

/// Kernel selected in the configuration.
#[derive(Debug, Clone, Copy)]
pub enum KernelKind {
    CubicSpline,
    WendlandC2,
}

impl Kernel for KernelKind {
    fn kernel(&self, r: f64, h: f64) -> f64 {
        match self {
            Self::CubicSpline => CubicSpline.kernel(r, h),
            Self::WendlandC2 => WendlandC2.kernel(r, h),
        }
    }

    fn derivative(&self, r: f64, h: f64) -> f64 {
        match self {
            Self::CubicSpline => CubicSpline.derivative(r, h),
            Self::WendlandC2 => WendlandC2.derivative(r, h),
        }
    }
}

#[cfg(test)]
mod test {
    use float_cmp::assert_approx_eq;

    use super::*;

    fn integrate(kernel: &impl Kernel, h: f64) -> f64 {
        let n = 2000;
        let dr = h / n as f64;
        (0..n)
            .map(|i| {
                let r = (i as f64 + 0.5) * dr;
                4. * PI * r * r * kernel.kernel(r, h) * dr
            })
            .sum()
    }

    #[test]
    fn test_normalisation() {
        assert_approx_eq!(f64, integrate(&CubicSpline, 0.7), 1., epsilon = 1e-4);
        assert_approx_eq!(f64, integrate(&WendlandC2, 1.3), 1., epsilon = 1e-4);
    }

    #[test]
    fn test_derivative() {
        let (r, h, dr) = (0.3, 1., 1e-6);
        for kernel in [KernelKind::CubicSpline, KernelKind::WendlandC2] {
            let numerical = (kernel.kernel(r + dr, h) - kernel.kernel(r - dr, h)) / (2. * dr);
            assert_approx_eq!(f64, kernel.derivative(r, h), numerical, epsilon = 1e-5);
        }
    }
}
