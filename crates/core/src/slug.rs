//! Deterministic slugification for filenames.

/// Maximum slug length in characters.
pub const MAX_SLUG_CHARS: usize = 60;

/// Slugify a string for use in a filename.
///
/// Lowercase, non-alphanumerics become `-`, runs collapse to one `-`,
/// leading/trailing dashes trimmed, truncated to [`MAX_SLUG_CHARS`] with any
/// trailing incomplete word removed. The same input always yields the same
/// slug.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_SLUG_CHARS + 1));
    let mut prev_dash = true; // suppress a leading dash
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            prev_dash = false;
        } else if !prev_dash {
            out.push('-');
            prev_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }

    if out.len() > MAX_SLUG_CHARS {
        // Cut at the limit, then drop the partial word unless the cut landed
        // exactly on a word boundary.
        let cut_on_boundary = out.as_bytes()[MAX_SLUG_CHARS] == b'-';
        out.truncate(MAX_SLUG_CHARS);
        if !cut_on_boundary {
            if let Some(idx) = out.rfind('-') {
                out.truncate(idx);
            }
        }
        while out.ends_with('-') {
            out.pop();
        }
    }

    if out.is_empty() {
        out.push_str("entry");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic() {
        assert_eq!(slugify("Hello, World!"), "hello-world");
        assert_eq!(slugify("alice@example.com"), "alice-example-com");
    }

    #[test]
    fn collapses_runs_and_trims() {
        assert_eq!(slugify("  a -- b  "), "a-b");
        assert_eq!(slugify("---"), "entry");
    }

    #[test]
    fn deterministic() {
        assert_eq!(slugify("Same Input"), slugify("Same Input"));
    }

    #[test]
    fn truncates_without_partial_word() {
        let long = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu";
        let slug = slugify(long);
        assert!(slug.len() <= MAX_SLUG_CHARS);
        assert!(!slug.ends_with('-'));
        // Every segment must be a complete word from the input.
        for part in slug.split('-') {
            assert!(long.contains(part), "partial word {part:?} survived");
        }
    }

    #[test]
    fn exact_boundary_keeps_word() {
        // 60 chars exactly, cut lands on the dash after "abcde".
        let input = "a".repeat(59) + " tail";
        let slug = slugify(&input);
        assert_eq!(slug, "a".repeat(59));
    }

    #[test]
    fn non_ascii_becomes_dashes() {
        assert_eq!(slugify("café au lait"), "caf-au-lait");
    }
}
