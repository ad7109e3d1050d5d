use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix timestamp in milliseconds.
pub fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Next value of the shared message sequence counter.
///
/// The counter is shared by a node and all its devices and wraps at 256.
pub fn next_seq(seq: u8) -> u8 {
    seq.wrapping_add(1)
}

/// Validate a group, node, device or host identifier.
///
/// Identifiers become topic levels, so the MQTT wildcard and separator
/// characters are forbidden.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("identifier must not be empty".into());
    }
    for c in name.chars() {
        if matches!(c, '+' | '/' | '#') {
            return Err(format!(
                "identifier {name:?} cannot contain '+', '/' or '#' characters"
            ));
        }
    }
    Ok(())
}
