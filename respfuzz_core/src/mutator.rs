use rand::Rng;
use rand_core::RngCore;

/// Characters the insertion mutator draws from.
pub const SPECIAL_CHARS: &str = "!@#$%^&*()_-+=<>?/";

/// A `Mutator` turns a sampled command template into the command actually sent.
///
/// Mutations are character-level and protocol-agnostic: they make no attempt to
/// keep the command syntactically valid. A malformed command is an intended
/// outcome, never an error.
pub trait Mutator {
    /// Produces a freshly allocated command derived from `command`.
    ///
    /// # Arguments
    /// * `command`: The template to derive from. It is never modified.
    /// * `rng`: The random number generator driving every mutation decision.
    fn mutate(&mut self, command: &str, rng: &mut dyn RngCore) -> String;
}

/// Inserts one character from [`SPECIAL_CHARS`] at a uniformly random
/// position in `[0, len]` of the command, counted in characters.
///
/// When disabled, commands pass through unchanged.
#[derive(Debug, Clone, Copy)]
pub struct SpecialCharMutator {
    enabled: bool,
}

impl SpecialCharMutator {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Mutator for SpecialCharMutator {
    fn mutate(&mut self, command: &str, rng: &mut dyn RngCore) -> String {
        if !self.enabled {
            return command.to_string();
        }

        let char_count = command.chars().count();
        // Inclusive upper bound: an empty command can only take an insertion at 0.
        let insert_at = rng.random_range(0..=char_count);
        let special_index = rng.random_range(0..SPECIAL_CHARS.len());
        let special_char = char::from(SPECIAL_CHARS.as_bytes()[special_index]);

        let byte_offset = command
            .char_indices()
            .nth(insert_at)
            .map_or(command.len(), |(offset, _)| offset);

        let mut mutated = String::with_capacity(command.len() + 1);
        mutated.push_str(&command[..byte_offset]);
        mutated.push(special_char);
        mutated.push_str(&command[byte_offset..]);
        mutated
    }
}
