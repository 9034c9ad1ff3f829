use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt, Layer,
};

/// Target every tunnel event is emitted under, so release builds can drop
/// the chatter of dependencies.
pub const TARGET: &str = "smtp_tunnel";

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:expr),*) => {{
        let span = $crate::tracing::span!(target: "smtp_tunnel", $level, $span);
        let _enter = span.enter();

        $crate::tracing::event!(target: "smtp_tunnel", $level, $($msg),*)
    }};
}

/// Bytes sent by the tunnel, to either leg.
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::outgoing!(level = TRACE, $($msg),*)
    };
}

/// Bytes received by the tunnel, from either leg.
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::incoming!(level = TRACE, $($msg),*)
    };
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

fn level_from(value: &str) -> LevelFilter {
    match value.to_ascii_lowercase().as_str() {
        "warn" => LevelFilter::WARN,
        "info" => LevelFilter::INFO,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::ERROR,
    }
}

/// Install the global subscriber. The level comes from `LOG_LEVEL`.
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init() {
    let level = std::env::var("LOG_LEVEL").map_or(
        if cfg!(debug_assertions) {
            LevelFilter::TRACE
        } else {
            LevelFilter::INFO
        },
        |level| level_from(&level),
    );

    let _ = tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_ansi(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    cfg!(debug_assertions) || metadata.target().starts_with(TARGET)
                })),
        )
        .try_init();
}

#[cfg(test)]
mod test {
    use tracing::metadata::LevelFilter;

    use super::level_from;

    #[test]
    fn level_names() {
        assert_eq!(level_from("WARN"), LevelFilter::WARN);
        assert_eq!(level_from("info"), LevelFilter::INFO);
        assert_eq!(level_from("Debug"), LevelFilter::DEBUG);
        assert_eq!(level_from("trace"), LevelFilter::TRACE);
        assert_eq!(level_from("off"), LevelFilter::OFF);
        assert_eq!(level_from("nonsense"), LevelFilter::ERROR);
    }

    #[test]
    fn init_twice() {
        super::init();
        super::init();
        crate::internal!(level = INFO, "logging initialised {}", 2);
    }
}
