// Logging shims.
//
// Every log statement in the crate goes through these macros so that the same call site works
// with the `log` facade on hosted builds, with `defmt` on the probe, or with neither (in which
// case the arguments are still evaluated by reference to avoid unused-variable warnings).

macro_rules! forward {
    ($level:ident, $s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "log")]
            ::log::$level!($s $(, $x)*);
            #[cfg(feature = "defmt")]
            ::defmt::$level!($s $(, $x)*);
            #[cfg(not(any(feature = "log", feature = "defmt")))]
            let _ = ($( & $x ),*);
        }
    };
}

macro_rules! error {
    ($($t:tt)*) => { $crate::fmt::forward!(error, $($t)*) };
}

// Named "warning" to avoid clashing with the builtin warn attribute, re-exported as warn below.
macro_rules! warning {
    ($($t:tt)*) => { $crate::fmt::forward!(warn, $($t)*) };
}

macro_rules! info {
    ($($t:tt)*) => { $crate::fmt::forward!(info, $($t)*) };
}

macro_rules! debug {
    ($($t:tt)*) => { $crate::fmt::forward!(debug, $($t)*) };
}

macro_rules! trace {
    ($($t:tt)*) => { $crate::fmt::forward!(trace, $($t)*) };
}

pub(crate) use {debug, error, forward, info, trace, warning as warn};
