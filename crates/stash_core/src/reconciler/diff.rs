//! Linear text diff for translating disk edits into CRDT splices.
//!
//! The diff is the common prefix/suffix reduction the file documents use for
//! `set_content`, surfaced as an explicit edit so the reconciler can apply it
//! to a *fork* of the last disk snapshot and three-way merge the result.
//! Positions count Unicode scalar values, matching the CRDT's addressing.

/// A single replace operation: delete `delete` code points at `pos`, then
/// insert `insert` there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    /// Start position in code points.
    pub pos: usize,
    /// Number of code points to delete.
    pub delete: usize,
    /// Replacement text.
    pub insert: String,
}

/// Compute the minimal single-span edit turning `old` into `new`.
///
/// Returns `None` when the strings are equal.
pub fn diff(old: &str, new: &str) -> Option<TextEdit> {
    if old == new {
        return None;
    }

    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let common_prefix = old_chars
        .iter()
        .zip(new_chars.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let remaining_old = old_chars.len() - common_prefix;
    let remaining_new = new_chars.len() - common_prefix;
    let common_suffix = old_chars[common_prefix..]
        .iter()
        .rev()
        .zip(new_chars[common_prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .take(remaining_old.min(remaining_new))
        .count();

    Some(TextEdit {
        pos: common_prefix,
        delete: old_chars.len() - common_prefix - common_suffix,
        insert: new_chars[common_prefix..new_chars.len() - common_suffix]
            .iter()
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_is_none() {
        assert_eq!(diff("same", "same"), None);
    }

    #[test]
    fn test_insert_in_middle() {
        let edit = diff("hello world", "hello brave world").unwrap();
        assert_eq!(edit.pos, 6);
        assert_eq!(edit.delete, 0);
        assert_eq!(edit.insert, "brave ");
    }

    #[test]
    fn test_delete_span() {
        let edit = diff("hello brave world", "hello world").unwrap();
        assert_eq!(edit.pos, 6);
        assert_eq!(edit.delete, 6);
        assert_eq!(edit.insert, "");
    }

    #[test]
    fn test_replace_span() {
        let edit = diff("one two three", "one 2 three").unwrap();
        assert_eq!(edit.pos, 4);
        assert_eq!(edit.delete, 3);
        assert_eq!(edit.insert, "2");
    }

    #[test]
    fn test_code_point_positions() {
        // 'é' is one code point even though it is two UTF-8 bytes.
        let edit = diff("héllo", "hello").unwrap();
        assert_eq!(edit.pos, 1);
        assert_eq!(edit.delete, 1);
        assert_eq!(edit.insert, "e");
    }

    #[test]
    fn test_full_replace() {
        let edit = diff("abc", "xyz").unwrap();
        assert_eq!(edit.pos, 0);
        assert_eq!(edit.delete, 3);
        assert_eq!(edit.insert, "xyz");
    }
}
