use std::mem::size_of;

/// Timebins are stored as `i8`
pub type Timebin = i8;
/// Integertime is stored as `u64'
pub type IntegerTime = u64;

pub const NUM_TIME_BINS: Timebin = 56;
/// The full run maps onto `[0, MAX_NR_TIMESTEPS]` on the integer time line.
pub const MAX_NR_TIMESTEPS: IntegerTime = get_integer_timestep(NUM_TIME_BINS);

/// Returns the integer timestep corresponding to a given timebin.
///
/// This is defined as 2^(timebin + 1). This way, timesteps are always
/// power of two multiples of each other.
pub const fn get_integer_timestep(bin: Timebin) -> IntegerTime {
    if bin <= 0 {
        0
    } else {
        1 << (bin + 1)
    }
}

/// Returns the time bin corresponding to a given timestep size.
///
/// log_2(x) = (number of bits in the type) - (number of leading 0-bits in x) - 1
pub const fn get_time_bin(time_step: IntegerTime) -> Timebin {
    ((8 * size_of::<IntegerTime>()) as u32 - time_step.leading_zeros() - 2) as i8
}

/// Returns the integer time corresponding to the start of the time-step
/// given by a time-bin.
pub const fn get_integer_time_begin(ti_current: IntegerTime, bin: Timebin) -> IntegerTime {
    let dti = get_integer_timestep(bin);

    if dti == 0 || ti_current == 0 {
        return 0;
    }

    dti * ((ti_current - 1) / dti)
}

/// Returns the integer time corresponding to the end of the time-step
/// given by a time-bin.
/// If the current time is a possible end for the given time-bin, return the
/// current time.
pub const fn get_integer_time_end(ti_current: IntegerTime, bin: Timebin) -> IntegerTime {
    let dti = get_integer_timestep(bin);

    if dti == 0 {
        return 0;
    }

    let modulus = ti_current % dti;

    if modulus == 0 {
        ti_current
    } else {
        ti_current - modulus + dti
    }
}

/// Conversion between physical time and the integer time line of one run.
#[derive(Debug, Clone, Copy)]
pub struct TimeLine {
    pub time_begin: f64,
    pub time_end: f64,
    pub time_base: f64,
    pub time_base_inv: f64,
}

impl TimeLine {
    pub fn new(time_begin: f64, time_end: f64) -> Self {
        let time_base = (time_end - time_begin) / MAX_NR_TIMESTEPS as f64;
        Self {
            time_begin,
            time_end,
            time_base,
            time_base_inv: 1. / time_base,
        }
    }

    pub fn time(&self, ti: IntegerTime) -> f64 {
        self.time_begin + ti as f64 * self.time_base
    }

    /// Integer time of a physical time, rounded up to the next tick.
    pub fn integer_time(&self, time: f64) -> IntegerTime {
        let ti = ((time - self.time_begin) * self.time_base_inv).ceil();
        if ti <= 0. {
            0
        } else {
            (ti as IntegerTime).min(MAX_NR_TIMESTEPS)
        }
    }

    pub fn dt(&self, dti: IntegerTime) -> f64 {
        dti as f64 * self.time_base
    }
}

/// Compute a valid integer time-step from a given physical time-step.
///
/// The step is put on the time line (a power of two that divides
/// `MAX_NR_TIMESTEPS`) and may at most double with respect to the old bin.
pub fn make_integer_timestep(
    dt: f64,
    old_bin: Timebin,
    ti_current: IntegerTime,
    time_base_inv: f64,
) -> IntegerTime {
    let mut new_dti = (dt * time_base_inv).min(MAX_NR_TIMESTEPS as f64) as IntegerTime;

    // Limit timestep increase.
    let current_dti = get_integer_timestep(old_bin);
    if old_bin > 0 {
        new_dti = new_dti.min(2 * current_dti);
    }

    // Put this timestep on the timeline
    let mut timeline_dti = MAX_NR_TIMESTEPS;
    while new_dti < timeline_dti {
        timeline_dti /= 2;
    }
    new_dti = timeline_dti;

    // Make sure we are allowed a timestep increase.
    if old_bin > 0 && new_dti > current_dti {
        let ti_end = get_integer_time_end(ti_current, old_bin);
        if (MAX_NR_TIMESTEPS - ti_end) % new_dti != 0 {
            new_dti = current_dti;
        }
    }

    new_dti
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn test_conversions() {
        let bin = 8;
        let ti = get_integer_timestep(bin);
        let bin2 = get_time_bin(ti);
        assert_eq!(bin, bin2);
    }

    #[test]
    fn test_time_end_and_begin() {
        let bin = 3;
        let dti = get_integer_timestep(bin);
        assert_eq!(get_integer_time_end(dti + 1, bin), 2 * dti);
        assert_eq!(get_integer_time_end(2 * dti, bin), 2 * dti);
        assert_eq!(get_integer_time_begin(2 * dti, bin), dti);
    }

    #[test]
    fn test_timeline_roundtrip() {
        let timeline = TimeLine::new(0., 1.);
        assert_eq!(timeline.integer_time(1.), MAX_NR_TIMESTEPS);
        assert_approx_eq!(f64, timeline.time(MAX_NR_TIMESTEPS / 2), 0.5);
    }

    #[test]
    fn test_make_integer_timestep() {
        let timeline = TimeLine::new(0., 1.);
        let dti = make_integer_timestep(0.3, 0, 0, timeline.time_base_inv);
        assert_eq!(dti, MAX_NR_TIMESTEPS / 4);
        assert_eq!(MAX_NR_TIMESTEPS % dti, 0);

        // At most a doubling of the previous step
        let old_bin = get_time_bin(MAX_NR_TIMESTEPS / 16);
        let dti = make_integer_timestep(0.9, old_bin, 0, timeline.time_base_inv);
        assert_eq!(dti, MAX_NR_TIMESTEPS / 8);
    }
}
