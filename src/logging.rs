use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Parse a `[logging] level` value; unknown values fall back to INFO.
pub fn parse_level(level: &str) -> Level {
    level.trim().parse().unwrap_or(Level::INFO)
}

pub fn init_logging(level: &str) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(level))
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok(); // Already set in tests
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level(" WARN "), Level::WARN);
        assert_eq!(parse_level("chatty"), Level::INFO);
    }
}
