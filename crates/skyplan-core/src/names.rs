//! Default name generation for resources the user did not name

use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "swift", "eager", "bright", "cosmic", "dapper", "fluent", "golden", "humble", "jovial", "keen",
    "lively", "mellow", "nimble", "plucky", "quick", "rustic", "snappy", "trusty", "vivid",
    "witty",
];

const NOUNS: &[&str] = &[
    "anvil", "beacon", "cirrus", "depot", "ember", "falcon", "gantry", "harbor", "island",
    "jetty", "keel", "lantern", "meadow", "nimbus", "orbit", "pier", "quarry", "ridge", "summit",
    "tundra",
];

/// Generate a default name like "nimble-harbor-2847".
///
/// Output always satisfies both the bucket and the resource name rules.
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    let number: u16 = rng.gen_range(1000..10000);
    format!("{}-{}-{}", adjective, noun, number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{validate_bucket_name, validate_resource_name};

    #[test]
    fn test_generate_name_format() {
        let name = generate();
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(ADJECTIVES.contains(&parts[0]));
        assert!(NOUNS.contains(&parts[1]));
        let number: u16 = parts[2].parse().unwrap();
        assert!((1000..10000).contains(&number));
    }

    #[test]
    fn test_generated_names_are_valid_everywhere() {
        for _ in 0..50 {
            let name = generate();
            assert!(validate_bucket_name(&name).is_ok());
            assert!(validate_resource_name(&name).is_ok());
        }
    }
}
