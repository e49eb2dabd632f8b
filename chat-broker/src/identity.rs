use crate::error::IdentityError;

/// Longest identity accepted, in characters.
pub const MAX_IDENTITY_LEN: usize = 32;

/// Identity no client may claim.
pub const RESERVED_IDENTITY: &str = "server";

/// Checks that `raw` is a well-formed identity and returns it trimmed.
///
/// The broker routes on identities verbatim, so anything that reaches
/// [`Broker::send_message`](crate::broker::Broker::send_message) or
/// `register_user` should pass through here first.
pub fn validate_identity(raw: &str) -> Result<String, IdentityError> {
    let id = raw.trim();

    if id.is_empty() {
        return Err(IdentityError::Empty);
    }
    if id.chars().count() > MAX_IDENTITY_LEN {
        return Err(IdentityError::TooLong {
            max: MAX_IDENTITY_LEN,
        });
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(IdentityError::InvalidCharacter);
    }
    if id.eq_ignore_ascii_case(RESERVED_IDENTITY) {
        return Err(IdentityError::Reserved(id.to_string()));
    }

    Ok(id.to_string())
}
