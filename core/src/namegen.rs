use crate::Error;

const MAX_RETRIES: u32 = 100;

const ADJECTIVES: &[&str] = &[
    "ancient", "brave", "calm", "clever", "crisp", "curious", "daring", "eager", "elegant",
    "fierce", "gentle", "golden", "humble", "jolly", "keen", "lively", "lucky", "mellow", "mighty",
    "nimble", "noble", "placid", "quiet", "quick", "rapid", "sharp", "silent", "silver", "sleepy",
    "solid", "spry", "steady", "stellar", "stoic", "sunny", "swift", "tidy", "tranquil", "vivid",
    "witty",
];

const NOUNS: &[&str] = &[
    "aurora", "badger", "beacon", "canyon", "cedar", "comet", "condor", "coral", "crane", "delta",
    "ember", "falcon", "galileo", "glacier", "harbor", "heron", "island", "juniper", "kestrel",
    "lagoon", "lantern", "lynx", "meadow", "meridian", "nebula", "orchid", "osprey", "otter",
    "panther", "pelican", "plateau", "prairie", "quartz", "raven", "ridge", "summit", "tundra",
    "vireo", "willow", "zephyr",
];

/// Generates a random `adjective-noun` name. Not guaranteed unique on its
/// own; callers that need uniqueness should use [`generate_unique`].
pub fn generate() -> String {
    let adjective = ADJECTIVES[rand::random_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rand::random_range(0..NOUNS.len())];
    format!("{adjective}-{noun}")
}

/// Generates a name for which `exists` returns `false`, retrying up to 100
/// times before giving up.
pub fn generate_unique(mut exists: impl FnMut(&str) -> bool) -> Result<String, Error> {
    for _ in 0..MAX_RETRIES {
        let candidate = generate();
        if !exists(&candidate) {
            return Ok(candidate);
        }
    }
    Err(Error::UserInput(
        "namegen: failed to generate unique name after 100 attempts".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generate_returns_adjective_dash_noun() {
        let name = generate();
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts.len(), 2);
        assert!(ADJECTIVES.contains(&parts[0]));
        assert!(NOUNS.contains(&parts[1]));
    }

    #[test]
    fn generate_unique_returns_first_nonexistent_candidate() {
        let name = generate_unique(|_| false).unwrap();
        assert!(name.contains('-'));
    }

    #[test]
    fn generate_unique_exhausts_at_exactly_100_attempts() {
        let mut calls = 0;
        let result = generate_unique(|_| {
            calls += 1;
            true
        });
        assert!(result.is_err());
        assert_eq!(calls, MAX_RETRIES);
    }

    #[test]
    fn generate_unique_skips_existing_names() {
        let mut seen = HashSet::new();
        seen.insert("ancient-aurora".to_string());
        let mut first_call = true;
        let result = generate_unique(|candidate| {
            if first_call {
                first_call = false;
                seen.contains(candidate) || candidate != "ancient-aurora"
            } else {
                false
            }
        });
        assert!(result.is_ok());
    }
}
