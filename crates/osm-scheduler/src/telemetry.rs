use tracing_subscriber::EnvFilter;

/// Installs a global fmt subscriber. `RUST_LOG` overrides `default_filter`.
/// Returns false when a subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_a_no_op() {
        let _ = init_tracing("osm_scheduler=debug");
        assert!(!init_tracing("info"));
    }
}
