use once_cell::sync::Lazy;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;

use crate::errors::{IpcError, Result};

pub const MAX_NAME_LENGTH: usize = 100;

/// Marker `new_channel` replaces with a random token.
pub const WILDCARD: char = '?';

const TOKEN_LENGTH: usize = 16;

static CHANNEL_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z\d\-_.]+((\?|!)[\d\w\-_.]*)?$").expect("channel name regex")
});

static GROUP_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z\d\-_.]+$").expect("group name regex"));

pub fn validate_channel(name: &str) -> Result<()> {
    if name.len() < MAX_NAME_LENGTH && CHANNEL_NAME.is_match(name) {
        Ok(())
    } else {
        Err(IpcError::InvalidName(format!("channel {:?}", name)))
    }
}

pub fn validate_group(name: &str) -> Result<()> {
    if name.len() < MAX_NAME_LENGTH && GROUP_NAME.is_match(name) {
        Ok(())
    } else {
        Err(IpcError::InvalidName(format!("group {:?}", name)))
    }
}

/// Replaces the single `?` in `pattern` with a random alphanumeric token.
/// Nothing is reserved; uniqueness rests on the token's length.
pub fn new_channel_name(pattern: &str) -> Result<String> {
    if pattern.matches(WILDCARD).count() != 1 {
        return Err(IpcError::InvalidName(format!(
            "pattern {:?} must contain exactly one {:?}",
            pattern, WILDCARD
        )));
    }
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect();
    let name = pattern.replacen(WILDCARD, &token, 1);
    validate_channel(&name)?;
    Ok(name)
}
