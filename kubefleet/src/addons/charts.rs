//! Helm charts bundled at build time.

include!(concat!(env!("OUT_DIR"), "/charts.rs"));

pub fn bundled(key: &str) -> Option<&'static [u8]> {
    CHARTS.iter().find(|(k, _)| *k == key).map(|(_, data)| *data)
}
