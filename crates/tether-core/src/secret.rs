//! Secret phrase generation and session derivation.
//!
//! ```text
//!   WordSource ──5 words──► SecretPhrase ──scrypt(salt = identity name)──► SessionId
//! ```
//!
//! The identity must be bound first: the KDF is salted with its name, so a
//! deriver without an identity refuses to produce a session id.

use std::sync::Arc;

use tether_crypto::{KdfParams, PHRASE_WORDS, SecretPhrase, SessionId};

use crate::{
    env::Environment,
    error::{KexError, StoreError},
    services::WordSource,
};

/// Built-in dictionary: 256 short, distinct, easily spoken words.
pub const DEFAULT_WORDS: [&str; 256] = [
    "acid", "acorn", "actor", "adobe", "agent", "album", "alert", "alley", "amber", "anchor",
    "angle", "ankle", "apple", "apron", "arena", "armor", "arrow", "ash", "atlas", "attic",
    "autumn", "axis", "bacon", "badge", "bagel", "baker", "bamboo", "banjo", "barn", "barrel",
    "basil", "basket", "beach", "beacon", "bean", "beard", "beaver", "bell", "bench", "berry",
    "bicycle", "bishop", "blade", "blanket", "blossom", "board", "bonnet", "boot", "bottle",
    "boulder", "bowl", "branch", "brass", "bread", "brick", "bridge", "bronze", "brook", "broom",
    "bucket", "buffalo", "bugle", "bunny", "butter", "button", "cabin", "cactus", "camel",
    "candle", "canoe", "canyon", "captain", "carbon", "carpet", "carrot", "castle", "cedar",
    "cellar", "chalk", "cherry", "chess", "chimney", "cider", "cinema", "circle", "citrus",
    "clam", "cliff", "clock", "cloud", "clover", "coast", "cobalt", "cocoa", "comet", "copper",
    "coral", "cotton", "cousin", "coyote", "crane", "crater", "crayon", "cricket", "crown",
    "crystal", "cube", "cup", "curtain", "cushion", "daisy", "dance", "delta", "denim", "desert",
    "diamond", "dinner", "dolphin", "domino", "donkey", "dragon", "drum", "dune", "eagle", "echo",
    "eclipse", "elbow", "ember", "emerald", "engine", "falcon", "feather", "fence", "fern",
    "ferry", "fiddle", "field", "fig", "flame", "flute", "forest", "fossil", "fountain", "fox",
    "frost", "galaxy", "garden", "garlic", "gecko", "geyser", "ginger", "glacier", "globe",
    "glove", "goat", "gold", "granite", "grape", "gravel", "guitar", "hammer", "harbor", "harp",
    "hazel", "helmet", "heron", "hill", "honey", "hornet", "hotel", "husky", "igloo", "island",
    "ivory", "jacket", "jaguar", "jelly", "jersey", "jigsaw", "jungle", "kayak", "kernel",
    "kettle", "kitten", "koala", "ladder", "lagoon", "lamp", "lantern", "laser", "lemon", "lily",
    "lizard", "lobster", "locket", "lotus", "lunar", "magnet", "mango", "maple", "marble",
    "meadow", "melon", "mirror", "mitten", "monkey", "mosaic", "moss", "motor", "mountain",
    "muffin", "nectar", "needle", "nickel", "noodle", "oasis", "ocean", "olive", "onion", "orbit",
    "orchid", "otter", "owl", "oyster", "paddle", "palace", "panda", "paper", "parrot", "peach",
    "pebble", "pepper", "piano", "pigeon", "pillow", "pine", "pirate", "planet", "plum", "pocket",
    "pony", "poppy", "puzzle", "quartz", "quilt", "rabbit", "radar", "radish", "rain", "raven",
    "reef", "ribbon", "river", "robin", "rocket", "rose",
];

/// Draws words uniformly from [`DEFAULT_WORDS`] using the environment's RNG.
#[derive(Debug, Clone)]
pub struct DictionaryWords<E: Environment> {
    env: E,
}

impl<E: Environment> DictionaryWords<E> {
    /// Word source backed by `env`.
    pub fn new(env: E) -> Self {
        Self { env }
    }
}

impl<E: Environment> WordSource for DictionaryWords<E> {
    fn word_list(&self, n: usize) -> Result<Vec<String>, StoreError> {
        let len = DEFAULT_WORDS.len() as u64;
        Ok((0..n)
            .map(|_| DEFAULT_WORDS[self.env.random_below(len) as usize].to_string())
            .collect())
    }
}

/// Turns phrases into session ids for one identity.
#[derive(Clone)]
pub struct SecretDeriver {
    words: Arc<dyn WordSource>,
    params: KdfParams,
    identity_name: Option<String>,
}

impl SecretDeriver {
    /// Deriver with no identity bound.
    pub fn new(words: Arc<dyn WordSource>, params: KdfParams) -> Self {
        Self { words, params, identity_name: None }
    }

    /// Bind the identity whose name salts the KDF.
    pub fn bind_identity(&mut self, name: impl Into<String>) {
        self.identity_name = Some(name.into());
    }

    /// Bound identity name, if any.
    pub fn identity_name(&self) -> Option<&str> {
        self.identity_name.as_deref()
    }

    /// KDF work factor in use.
    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Draw a fresh phrase and derive its session id.
    ///
    /// Blocks for the full KDF; async callers run it off the executor.
    pub fn generate_secret(&self) -> Result<(SecretPhrase, SessionId), KexError> {
        if self.identity_name.is_none() {
            return Err(KexError::IdentityMissing);
        }

        let words = self
            .words
            .word_list(PHRASE_WORDS)
            .map_err(|e| KexError::WordListUnavailable(e.to_string()))?;
        let phrase = SecretPhrase::new(words)?;
        let session_id = self.derive_session_id(&phrase)?;
        Ok((phrase, session_id))
    }

    /// Derive the session id for a phrase read in from the peer device.
    pub fn derive_session_id(&self, phrase: &SecretPhrase) -> Result<SessionId, KexError> {
        let name = self.identity_name.as_deref().ok_or(KexError::IdentityMissing)?;
        let session_id = tether_crypto::derive_session_id(phrase, name, &self.params)?;
        tracing::debug!(identity = name, session = ?session_id, "derived session id");
        Ok(session_id)
    }
}

impl std::fmt::Debug for SecretDeriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretDeriver")
            .field("params", &self.params)
            .field("identity_name", &self.identity_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::env::test_utils::MockEnv;

    const FAST: KdfParams = KdfParams { log_n: 4, r: 8, p: 1 };

    fn deriver(seed: u64) -> SecretDeriver {
        SecretDeriver::new(Arc::new(DictionaryWords::new(MockEnv::seeded(seed))), FAST)
    }

    fn phrase(words: [&str; 5]) -> SecretPhrase {
        SecretPhrase::new(words.map(str::to_owned).to_vec()).unwrap()
    }

    #[test]
    fn dictionary_has_no_duplicates() {
        let unique: HashSet<_> = DEFAULT_WORDS.iter().collect();
        assert_eq!(unique.len(), DEFAULT_WORDS.len());
    }

    #[test]
    fn derive_without_identity_fails() {
        let deriver = deriver(1);
        let words = phrase(["alpha", "bravo", "charlie", "delta", "echo"]);
        assert_eq!(deriver.derive_session_id(&words), Err(KexError::IdentityMissing));
        assert!(matches!(deriver.generate_secret(), Err(KexError::IdentityMissing)));
    }

    #[test]
    fn both_sides_derive_same_session() {
        let mut provisioner = deriver(1);
        let mut provisionee = deriver(2);
        provisioner.bind_identity("alice");
        provisionee.bind_identity("alice");

        let words = phrase(["alpha", "bravo", "charlie", "delta", "echo"]);
        assert_eq!(
            provisioner.derive_session_id(&words).unwrap(),
            provisionee.derive_session_id(&words).unwrap()
        );
    }

    #[test]
    fn wrong_last_word_changes_session() {
        let mut deriver = deriver(1);
        deriver.bind_identity("alice");

        let good = deriver.derive_session_id(&phrase(["alpha", "bravo", "charlie", "delta", "echo"]));
        let bad = deriver.derive_session_id(&phrase(["alpha", "bravo", "charlie", "delta", "zulu"]));
        assert_ne!(good.unwrap(), bad.unwrap());
    }

    #[test]
    fn identity_name_salts_session() {
        let words = phrase(["alpha", "bravo", "charlie", "delta", "echo"]);
        let mut alice = deriver(1);
        alice.bind_identity("alice");
        let mut bob = deriver(1);
        bob.bind_identity("bob");

        assert_ne!(alice.derive_session_id(&words).unwrap(), bob.derive_session_id(&words).unwrap());
    }

    #[test]
    fn generated_phrase_rederives_to_same_session() {
        let mut deriver = deriver(7);
        deriver.bind_identity("alice");

        let (words, session_id) = deriver.generate_secret().unwrap();
        assert_eq!(words.words().len(), PHRASE_WORDS);
        assert!(words.words().iter().all(|w| DEFAULT_WORDS.contains(&w.as_str())));

        let typed = SecretPhrase::parse(&words.joined()).unwrap();
        assert_eq!(deriver.derive_session_id(&typed).unwrap(), session_id);
    }

    #[test]
    fn seeded_word_source_is_reproducible() {
        let a = DictionaryWords::new(MockEnv::seeded(42)).word_list(5).unwrap();
        let b = DictionaryWords::new(MockEnv::seeded(42)).word_list(5).unwrap();
        assert_eq!(a, b);
    }
}
