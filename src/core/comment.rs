//! Comment tags used as idempotency keys
//!
//! Every rule this crate appends carries `-m comment --comment [[description]]`.
//! The kernel ignores the comment for matching, but it survives a round trip
//! through `iptables -S`, so the description identifies the rule's purpose in
//! existence checks, deletes and listings.

use crate::core::error::{Error, Result};
use std::fmt;

/// Opening delimiter of a comment tag
pub const COMMENT_PREFIX: &str = "[[";
/// Closing delimiter of a comment tag
pub const COMMENT_SUFFIX: &str = "]]";

/// Kernel limit for comment match text (`XT_MAX_COMMENT_LEN` minus the NUL)
pub const MAX_COMMENT_LEN: usize = 255;

/// A validated, wrapped description ready to be passed as one argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommentTag(String);

impl CommentTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The description this tag was built from.
    pub fn description(&self) -> &str {
        // Construction guarantees both delimiters are present
        unwrap_comment(&self.0).unwrap_or(&self.0)
    }
}

impl fmt::Display for CommentTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CommentTag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Wraps a description into its comment tag.
///
/// # Errors
///
/// Returns `Error::Validation` if the description is empty, contains a
/// delimiter sequence, quotes, backslashes or control characters, or would
/// exceed the kernel comment length once wrapped.
pub fn wrap_comment(description: &str) -> Result<CommentTag> {
    crate::validators::validate_description(description)
        .map_err(|message| Error::validation("description", message))?;

    if description.contains(COMMENT_PREFIX) || description.contains(COMMENT_SUFFIX) {
        return Err(Error::validation(
            "description",
            format!("must not contain '{COMMENT_PREFIX}' or '{COMMENT_SUFFIX}'"),
        ));
    }

    let tag = format!("{COMMENT_PREFIX}{description}{COMMENT_SUFFIX}");
    if tag.len() > MAX_COMMENT_LEN {
        return Err(Error::validation(
            "description",
            format!(
                "too long ({} bytes, max {})",
                description.len(),
                MAX_COMMENT_LEN - COMMENT_PREFIX.len() - COMMENT_SUFFIX.len()
            ),
        ));
    }

    Ok(CommentTag(tag))
}

/// Recovers the description from a comment found in a live listing.
///
/// Returns `None` for comments that were not written by this crate.
pub fn unwrap_comment(tag: &str) -> Option<&str> {
    tag.strip_prefix(COMMENT_PREFIX)?
        .strip_suffix(COMMENT_SUFFIX)
}
