//! Corpus directory listing.
//!
//! A single [`ExtensionFilter`] decides which files count as corpus images,
//! for both identity-registry construction and sample extraction.

use std::path::{Path, PathBuf};

const DEFAULT_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Case-insensitive file extension allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionFilter {
    /// Lowercase, without the leading dot.
    extensions: Vec<String>,
}

impl Default for ExtensionFilter {
    fn default() -> Self {
        Self::new(DEFAULT_EXTENSIONS)
    }
}

impl ExtensionFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut extensions: Vec<String> = extensions
            .into_iter()
            .map(|e| e.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        extensions.sort();
        extensions.dedup();
        Self { extensions }
    }

    /// Parse a comma-separated list such as `"jpg, .PNG"`.
    ///
    /// An empty list falls back to the default extensions.
    pub fn parse(list: &str) -> Self {
        let filter = Self::new(list.split(','));
        if filter.extensions.is_empty() {
            Self::default()
        } else {
            filter
        }
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }
}

/// List corpus image files in `dir`, sorted by file name.
///
/// Subdirectories and files rejected by `filter` are left out.
pub fn list_images(dir: &Path, filter: &ExtensionFilter) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if filter.matches(&path) {
            paths.push(path);
        } else {
            tracing::trace!(path = %path.display(), "not a corpus image, ignoring");
        }
    }
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_case_insensitive() {
        let f = ExtensionFilter::default();
        assert!(f.matches(Path::new("a.101.1.jpg")));
        assert!(f.matches(Path::new("a.101.1.JPEG")));
        assert!(f.matches(Path::new("dir/a.101.1.Png")));
        assert!(!f.matches(Path::new("a.101.1.gif")));
        assert!(!f.matches(Path::new("README")));
    }

    #[test]
    fn test_parse_list() {
        let f = ExtensionFilter::parse(" .BMP, png ,,");
        assert_eq!(f.extensions(), &["bmp".to_string(), "png".to_string()]);
        assert!(f.matches(Path::new("x.bmp")));
        assert!(!f.matches(Path::new("x.jpg")));
    }

    #[test]
    fn test_parse_empty_falls_back_to_default() {
        assert_eq!(ExtensionFilter::parse(" , "), ExtensionFilter::default());
    }

    #[test]
    fn test_list_images_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.2.1.png", "a.1.1.JPG", "notes.txt", "c.3.1.jpeg"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.4.1.jpg")).unwrap();

        let listed: Vec<String> = list_images(dir.path(), &ExtensionFilter::default())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(listed, vec!["a.1.1.JPG", "b.2.1.png", "c.3.1.jpeg"]);
    }

    #[test]
    fn test_list_images_missing_dir() {
        assert!(list_images(Path::new("/nonexistent/corpus"), &ExtensionFilter::default()).is_err());
    }
}
