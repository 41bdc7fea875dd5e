//! Network and endpoint ID generation.

/// Length of a full ID in hex characters.
pub const ID_LENGTH: usize = 64;

/// Length of the short form of an ID.
pub const SHORT_ID_LENGTH: usize = 12;

/// Generate a new random ID.
///
/// The ID is a 64-character lowercase hex string built from two UUID v4
/// values. IDs that consist only of digits are rejected and regenerated so
/// they are never mistaken for numbers.
#[must_use]
pub fn generate_id() -> String {
    loop {
        let mut id = hex::encode(uuid::Uuid::new_v4().as_bytes());
        id.push_str(&hex::encode(uuid::Uuid::new_v4().as_bytes()));
        if !id[..SHORT_ID_LENGTH].bytes().all(|b| b.is_ascii_digit()) {
            return id;
        }
    }
}

/// Returns a short version of the ID (first 12 characters).
#[must_use]
pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LENGTH).unwrap_or(id)
}
