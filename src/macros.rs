/// Report an unrecoverable condition and abort the current rank.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        panic!($($arg)*)
    }};
}

/// Log how long an engine phase took, at debug level.
macro_rules! timed {
    ($label:expr, $body:expr) => {{
        let tic = std::time::Instant::now();
        let result = $body;
        tracing::debug!("{} took {:.3} ms.", $label, tic.elapsed().as_secs_f64() * 1e3);
        result
    }};
}

pub(crate) use fatal;
pub(crate) use timed;
