//! Idempotent modification patches.
//!
//! The gate never edits a draft decision in place; it attaches patches that
//! the caller (or the finalize stage) applies. A patch replaces every
//! occurrence of `find` with `replace` in one named field. Because the
//! replacement token never contains the needle, applying a patch twice
//! yields the same text as applying it once.

use serde::{Deserialize, Serialize};

/// Field a patch applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchField {
    Query,
    ChosenTitle,
    ChosenRationale,
}

/// One redaction/modification patch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub field: PatchField,
    pub find: String,
    pub replace: String,
}

impl Patch {
    #[must_use]
    pub fn new(field: PatchField, find: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            field,
            find: find.into(),
            replace: replace.into(),
        }
    }

    /// Apply this patch to `text`.
    #[must_use]
    pub fn apply(&self, text: &str) -> String {
        if self.find.is_empty() {
            return text.to_string();
        }
        text.replace(&self.find, &self.replace)
    }
}

/// Apply all patches targeting `field` to `text`, in order.
#[must_use]
pub fn apply_all(patches: &[Patch], field: PatchField, text: &str) -> String {
    patches
        .iter()
        .filter(|p| p.field == field)
        .fold(text.to_string(), |acc, p| p.apply(&acc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_replaces_all_occurrences() {
        let patch = Patch::new(PatchField::Query, "a@b.com", "[REDACTED:email]");
        assert_eq!(
            patch.apply("mail a@b.com or a@b.com"),
            "mail [REDACTED:email] or [REDACTED:email]"
        );
    }

    #[test]
    fn applying_twice_equals_once() {
        let patch = Patch::new(PatchField::ChosenRationale, "555-1234", "[REDACTED:phone]");
        let once = patch.apply("call 555-1234 now");
        let twice = patch.apply(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_needle_is_a_no_op() {
        let patch = Patch::new(PatchField::Query, "", "x");
        assert_eq!(patch.apply("unchanged"), "unchanged");
    }

    #[test]
    fn apply_all_filters_by_field() {
        let patches = vec![
            Patch::new(PatchField::Query, "secret", "[X]"),
            Patch::new(PatchField::ChosenRationale, "secret", "[Y]"),
        ];
        assert_eq!(apply_all(&patches, PatchField::Query, "a secret"), "a [X]");
    }
}
