use rand::Rng;
use rand::distr::Alphanumeric;

/// Tokens carrying this prefix are looked up as virtual keys, never forwarded.
pub const VIRTUAL_KEY_PREFIX: &str = "wvk_";
const TOKEN_RANDOM_LEN: usize = 40;
const DISPLAY_PREFIX_LEN: usize = 12;

pub fn is_virtual_key(token: &str) -> bool {
    token.starts_with(VIRTUAL_KEY_PREFIX)
}

pub fn generate_token() -> String {
    let random: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(TOKEN_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{VIRTUAL_KEY_PREFIX}{random}")
}

pub fn hash_token(token: &str) -> String {
    blake3::hash(token.as_bytes()).to_hex().to_string()
}

/// Non-secret leading part kept for display.
pub fn display_prefix(token: &str) -> String {
    token.chars().take(DISPLAY_PREFIX_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_prefixed_and_distinct() {
        let a = generate_token();
        let b = generate_token();
        assert!(is_virtual_key(&a));
        assert_eq!(a.len(), VIRTUAL_KEY_PREFIX.len() + TOKEN_RANDOM_LEN);
        assert_ne!(a, b);
        assert_ne!(hash_token(&a), hash_token(&b));
        assert_eq!(display_prefix(&a).len(), DISPLAY_PREFIX_LEN);
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(hash_token("wvk_abc"), hash_token("wvk_abc"));
        assert!(!is_virtual_key("sk-abc"));
    }
}
