use crate::detector::fingerprint::fingerprint;
use crate::types::{Classification, Market};

/// Classify a market against the fingerprint stored for the same ticker.
/// Returns the classification together with the freshly computed fingerprint.
pub fn classify(market: &Market, stored: Option<&str>) -> (Classification, String) {
    let current = fingerprint(market);
    let class = match stored {
        None => Classification::Create,
        Some(prev) if prev == current => Classification::Unchanged,
        Some(_) => Classification::Update,
    };
    (class, current)
}
