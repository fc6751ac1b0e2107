use std::path::Path;

use regex::{Captures, Regex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// What a patch did to one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOutcome {
    /// Image lines that referenced the identifier
    pub matched: usize,
    /// Whether any of those lines carried a different tag
    pub changed: bool,
}

/// Build the image-line pattern for `identifier`.
///
/// The identifier must be the last path segment of the reference and be
/// directly followed by `:`; the tag runs up to whitespace, a quote or `#`.
/// Lines whose `image:` key sits behind a `#` are left alone.
fn image_pattern(identifier: &str) -> Result<Regex> {
    let pattern = format!(
        r#"(?m)^(?P<prefix>[^\n#]*\bimage:[ \t]*["']?(?:[^\s"'#]*/)?{}):(?P<tag>[^\s"'#/]+)(?P<suffix>[\s"'#]|$)"#,
        regex::escape(identifier)
    );
    Ok(Regex::new(&pattern)?)
}

/// Replace the tag of every image line referencing `identifier`.
///
/// Returns the new content and the number of lines that matched. Text
/// outside the tag token is carried over byte for byte.
pub fn patch_content(content: &str, identifier: &str, tag: &str) -> Result<(String, usize)> {
    let re = image_pattern(identifier)?;
    let mut matched = 0;
    let patched = re.replace_all(content, |caps: &Captures<'_>| {
        matched += 1;
        debug!(from = &caps["tag"], to = tag, "Rewriting image tag");
        format!("{}:{}{}", &caps["prefix"], tag, &caps["suffix"])
    });
    Ok((patched.into_owned(), matched))
}

/// Patch the file at `path` in place.
///
/// Fails with [`Error::ImageReferenceNotFound`] when no line references the
/// identifier. The file is only written when its content changes.
pub fn patch_file(path: &Path, identifier: &str, tag: &str) -> Result<PatchOutcome> {
    let content = std::fs::read_to_string(path)?;
    let (patched, matched) = patch_content(&content, identifier, tag)?;

    if matched == 0 {
        return Err(Error::ImageReferenceNotFound {
            path: path.to_path_buf(),
            identifier: identifier.to_string(),
        });
    }
    if matched > 1 {
        warn!(path = %path.display(), matched, identifier, "Several image lines reference the service; patching all");
    }

    let changed = patched != content;
    if changed {
        std::fs::write(path, patched)?;
        info!(path = %path.display(), tag, matched, "Patched image tag");
    } else {
        info!(path = %path.display(), tag, "Image tag already up to date");
    }

    Ok(PatchOutcome { matched, changed })
}
