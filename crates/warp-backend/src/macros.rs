//! Dispatcher debug macros
//!
//! Both take the [`Chain`](crate::chain::Chain) first and emit only when
//! the matching [`DebugFlags`](crate::config::DebugFlags) switch is on.

macro_rules! controlpath_debug {
    ($chain:expr, $($arg:tt)+) => {
        if $chain.config().debug.controlpath {
            ::tracing::debug!(target: $crate::logging::CONTROLPATH_TARGET, $($arg)+);
        }
    };
}

macro_rules! datapath_debug {
    ($chain:expr, $($arg:tt)+) => {
        if $chain.config().debug.datapath {
            ::tracing::debug!(target: $crate::logging::DATAPATH_TARGET, $($arg)+);
        }
    };
}
