//! Alias table resolving external key names to canonical property names.
//!
//! # Responsibility
//! - Keep an ordered `alias -> canonical` table per object.
//! - Resolve incoming names (JSON fields, legacy columns) before property access.
//!
//! # Invariants
//! - An alias appears at most once; re-adding an alias re-points it.
//! - Removal only prunes entries whose stored pair matches exactly.
//! - `log_undefined_mappings` only controls diagnostics, never resolution.

/// Ordered alias table with an optional diagnostics flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMapping {
    entries: Vec<(String, String)>,
    log_undefined_mappings: bool,
}

impl KeyMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from `(alias, canonical)` pairs, preserving order.
    pub fn with_mapping<I, A, C>(mapping: I) -> Self
    where
        I: IntoIterator<Item = (A, C)>,
        A: Into<String>,
        C: Into<String>,
    {
        let mut table = Self::new();
        table.add_key_mapping(mapping);
        table
    }

    /// Returns entries in insertion order.
    pub fn mappings(&self) -> &[(String, String)] {
        &self.entries
    }

    /// Merges entries into the table.
    ///
    /// Existing aliases keep their position but take the new canonical name.
    pub fn add_key_mapping<I, A, C>(&mut self, mapping: I)
    where
        I: IntoIterator<Item = (A, C)>,
        A: Into<String>,
        C: Into<String>,
    {
        for (alias, canonical) in mapping {
            let alias = alias.into();
            let canonical = canonical.into();
            match self.entries.iter_mut().find(|(known, _)| *known == alias) {
                Some(entry) => entry.1 = canonical,
                None => self.entries.push((alias, canonical)),
            }
        }
    }

    /// Prunes entries whose `alias -> canonical` pair matches exactly.
    pub fn remove_key_mapping<I, A, C>(&mut self, mapping: I)
    where
        I: IntoIterator<Item = (A, C)>,
        A: AsRef<str>,
        C: AsRef<str>,
    {
        for (alias, canonical) in mapping {
            let (alias, canonical) = (alias.as_ref(), canonical.as_ref());
            self.entries
                .retain(|(known_alias, known_canonical)| {
                    known_alias != alias || known_canonical != canonical
                });
        }
    }

    /// Resolves `key` to its canonical name, or returns it unchanged.
    pub fn map_key<'a>(&'a self, key: &'a str) -> &'a str {
        self.entries
            .iter()
            .find(|(alias, _)| alias == key)
            .map_or(key, |(_, canonical)| canonical.as_str())
    }

    /// Returns every alias pointing at `canonical`.
    pub fn aliases_for<'a>(&'a self, canonical: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(_, target)| target == canonical)
            .map(|(alias, _)| alias.as_str())
    }

    pub fn log_undefined_mappings(&self) -> bool {
        self.log_undefined_mappings
    }

    pub fn set_log_undefined_mappings(&mut self, flag: bool) {
        self.log_undefined_mappings = flag;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::KeyMapping;

    #[test]
    fn map_key_resolves_alias_and_passes_through_unknown() {
        let mapping = KeyMapping::with_mapping([("user_name", "username"), ("id", "key")]);

        assert_eq!(mapping.map_key("user_name"), "username");
        assert_eq!(mapping.map_key("id"), "key");
        assert_eq!(mapping.map_key("age"), "age");
    }

    #[test]
    fn add_key_mapping_repoints_existing_alias_in_place() {
        let mut mapping = KeyMapping::with_mapping([("name", "username"), ("id", "key")]);
        mapping.add_key_mapping([("name", "title"), ("views", "views_count")]);

        assert_eq!(
            mapping.mappings(),
            &[
                ("name".to_string(), "title".to_string()),
                ("id".to_string(), "key".to_string()),
                ("views".to_string(), "views_count".to_string()),
            ]
        );
    }

    #[test]
    fn remove_key_mapping_requires_exact_pair() {
        let mut mapping = KeyMapping::with_mapping([("name", "username")]);

        mapping.remove_key_mapping([("name", "title")]);
        assert_eq!(mapping.map_key("name"), "username");

        mapping.remove_key_mapping([("name", "username")]);
        assert_eq!(mapping.map_key("name"), "name");
        assert!(mapping.is_empty());
    }

    #[test]
    fn aliases_for_lists_every_alias_of_a_property() {
        let mapping =
            KeyMapping::with_mapping([("name", "username"), ("login", "username"), ("id", "key")]);

        let aliases: Vec<_> = mapping.aliases_for("username").collect();
        assert_eq!(aliases, vec!["name", "login"]);
    }

    #[test]
    fn logging_flag_does_not_change_resolution() {
        let mut mapping = KeyMapping::with_mapping([("name", "username")]);
        mapping.set_log_undefined_mappings(true);

        assert!(mapping.log_undefined_mappings());
        assert_eq!(mapping.map_key("name"), "username");
        assert_eq!(mapping.map_key("missing"), "missing");
    }
}
