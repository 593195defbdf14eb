#[derive(Debug, Clone, Copy)]
pub enum EquationOfState {
    Ideal { gamma: f64 },
    Isothermal { internal_energy: f64, gamma: f64 },
}

impl EquationOfState {
    pub fn gamma(&self) -> f64 {
        match self {
            EquationOfState::Ideal { gamma } | EquationOfState::Isothermal { gamma, .. } => *gamma,
        }
    }

    pub fn pressure(&self, density: f64, internal_energy: f64) -> f64 {
        match self {
            EquationOfState::Ideal { gamma } => (gamma - 1.) * density * internal_energy,
            EquationOfState::Isothermal { internal_energy, gamma } => (gamma - 1.) * density * internal_energy,
        }
    }

    pub fn sound_speed(&self, density: f64, internal_energy: f64) -> f64 {
        if density <= 0. {
            return 0.;
        }
        (self.gamma() * self.pressure(density, internal_energy) / density).sqrt()
    }
}

#[cfg(test)]
mod test {
    use float_cmp::assert_approx_eq;

    use super::*;

    #[test]
    fn test_ideal() {
        let eos = EquationOfState::Ideal { gamma: 5. / 3. };
        assert_approx_eq!(f64, eos.pressure(2., 1.5), 2.);
        assert_approx_eq!(f64, eos.sound_speed(2., 1.5), (5f64 / 3.).sqrt());
        let iso = EquationOfState::Isothermal { internal_energy: 1.5, gamma: 5. / 3. };
        assert_approx_eq!(f64, iso.pressure(2., 100.), 2.);
    }
}
