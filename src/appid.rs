//! App identifiers.
//!
//! An appId names one application instance on one device and owns a writer
//! subtree in the shared directory. The format is `<device>-<appName>`,
//! optionally suffixed with a zero-padded random tail so several instances
//! of the same application can share a device.

use rand::Rng;

/// Generate an appId for this device.
///
/// With `is_random`, a `-<5-digit>` tail drawn uniformly from
/// `[0, 100000)` is appended.
pub fn generate_app_id(app_name: &str, is_random: bool) -> String {
    let device = device_name();
    if is_random {
        let tail: u32 = rand::rng().random_range(0..100_000);
        format!("{device}-{app_name}-{tail:05}")
    } else {
        format!("{device}-{app_name}")
    }
}

fn device_name() -> String {
    whoami::fallible::hostname().unwrap_or_else(|_| "unknown".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_app_id_is_device_dash_name() {
        let id = generate_app_id("app", false);
        assert!(id.ends_with("-app"), "{id}");
    }

    #[test]
    fn random_app_id_has_five_digit_tail() {
        let id = generate_app_id("app", true);
        let tail = id.rsplit('-').next().unwrap();
        assert_eq!(tail.len(), 5, "{id}");
        assert!(tail.chars().all(|c| c.is_ascii_digit()), "{id}");
    }

    #[test]
    fn random_app_ids_differ() {
        let ids: Vec<String> = (0..8).map(|_| generate_app_id("app", true)).collect();
        let distinct: std::collections::BTreeSet<&String> = ids.iter().collect();
        assert!(distinct.len() > 1, "{ids:?}");
    }
}
