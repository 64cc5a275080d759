//! Display-only redaction. Not an access control: nothing here ever touches
//! stored or transmitted secret material.

const MASK_PREFIX: &str = "********";

/// Fixed-width asterisk prefix plus the last three characters.
/// Values shorter than three characters are fully hidden.
pub fn mask(plaintext: &str) -> String {
    let chars: Vec<char> = plaintext.chars().collect();
    if chars.len() < 3 {
        return format!("{}***", MASK_PREFIX);
    }
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{}{}", MASK_PREFIX, tail)
}
