use std::path::PathBuf;

/// Named subdirectories of the durable store, in ascending eviction
/// priority: caches go before user-durable annotation state.
pub const BATCHES_DIR: &str = "batches";
pub const INDEX_DIR: &str = "index";
pub const TAGS_DIR: &str = "tags";

pub const ALL_DIRS: [&str; 3] = [BATCHES_DIR, INDEX_DIR, TAGS_DIR];

/// Directory layout of the persistent store.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StoreLayout { root: root.into() }
    }

    pub fn dir_path(&self, directory: &str) -> PathBuf {
        self.root.join(directory)
    }

    pub fn file_path(&self, directory: &str, name: &str) -> PathBuf {
        self.root.join(directory).join(name)
    }

    pub fn probe_path(&self) -> PathBuf {
        self.root.join(".probe")
    }
}

const MAX_SANITIZED_LEN: usize = 120;

/// Map an arbitrary source file name to a name safe for the store.
/// Alphanumerics, `-`, `_` and `.` pass through; everything else
/// becomes `_`. The result is length-capped.
pub fn sanitize_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len().min(MAX_SANITIZED_LEN));
    for ch in name.chars() {
        if out.len() >= MAX_SANITIZED_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() || out.chars().all(|c| c == '.') {
        out = "unnamed".to_string();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_file_name("my data (v2).csv"), "my_data__v2_.csv");
        assert_eq!(sanitize_file_name("../../etc/passwd"), ".._.._etc_passwd");
    }

    #[test]
    fn sanitize_never_returns_empty() {
        assert_eq!(sanitize_file_name(""), "unnamed");
        assert_eq!(sanitize_file_name(".."), "unnamed");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "x".repeat(500);
        assert!(sanitize_file_name(&long).len() <= MAX_SANITIZED_LEN);
    }
}
