use super::SystemInfo;

/// Number of desired properties the actual configuration does not satisfy.
///
/// A property counts as satisfied when present with an equal value; numeric
/// values compare numerically so "8" and "8.0" match. Zero means the node
/// already has the desired configuration.
pub fn configuration_distance(desired: &SystemInfo, actual: &SystemInfo) -> u32 {
    desired
        .iter()
        .filter(|(key, wanted)| match actual.get(key) {
            Some(have) => !values_match(wanted, have),
            None => true,
        })
        .count() as u32
}

fn values_match(a: &str, b: &str) -> bool {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => (x - y).abs() < f64::EPSILON,
        _ => a.trim() == b.trim(),
    }
}
