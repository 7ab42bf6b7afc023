use std::time::{SystemTime, UNIX_EPOCH};

const ADJECTIVES: &[&str] = &[
    "quick", "brave", "clever", "rusty", "silent", "golden", "husky", "lucky", "fuzzy", "bright",
    "calm", "sly",
];

const NOUNS: &[&str] = &[
    "fox", "otter", "panda", "tiger", "beetle", "hawk", "lark", "walrus", "badger", "heron",
    "koala", "moose",
];

/// A human-friendly terminal id such as `mcp-calm-otter`, picked from the clock.
pub fn generate_name() -> String {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    name_from_seed(seed)
}

pub fn name_from_seed(seed: u64) -> String {
    let adjective = ADJECTIVES[(seed % ADJECTIVES.len() as u64) as usize];
    let noun = NOUNS[((seed >> 16) % NOUNS.len() as u64) as usize];
    format!("mcp-{}-{}", adjective, noun)
}

/// `base` with a short random suffix, used when `base` is already taken.
pub fn with_random_suffix(base: &str) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", base, &uuid[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_names_are_stable() {
        assert_eq!(name_from_seed(0), "mcp-quick-fox");
        assert_eq!(name_from_seed(1 | (1 << 16)), "mcp-brave-otter");
    }

    #[test]
    fn generated_names_have_the_expected_shape() {
        let name = generate_name();
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "mcp");
        assert!(ADJECTIVES.contains(&parts[1]));
        assert!(NOUNS.contains(&parts[2]));
    }

    #[test]
    fn suffix_differs_between_calls() {
        let a = with_random_suffix("mcp-calm-fox");
        let b = with_random_suffix("mcp-calm-fox");
        assert!(a.starts_with("mcp-calm-fox-"));
        assert_eq!(a.len(), "mcp-calm-fox-".len() + 8);
        assert_ne!(a, b);
    }
}
