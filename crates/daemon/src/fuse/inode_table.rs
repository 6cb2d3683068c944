//! Bidirectional inode to path mapping.
//!
//! FUSE identifies everything by 64-bit inode numbers while the metadata
//! store speaks logical paths. Inodes are allocated lazily and never
//! reused within a mount's lifetime.

use std::collections::HashMap;

/// Bidirectional mapping between inodes and logical paths.
#[derive(Debug)]
pub struct InodeTable {
    path_to_inode: HashMap<String, u64>,
    inode_to_path: HashMap<u64, String>,
    next_inode: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Root inode number (always 1 in FUSE).
    pub const ROOT_INODE: u64 = 1;

    pub fn new() -> Self {
        let mut table = Self {
            path_to_inode: HashMap::new(),
            inode_to_path: HashMap::new(),
            next_inode: 2,
        };
        table.path_to_inode.insert("/".to_string(), Self::ROOT_INODE);
        table.inode_to_path.insert(Self::ROOT_INODE, "/".to_string());
        table
    }

    pub fn get_or_create(&mut self, path: &str) -> u64 {
        let normalized = normalize_path(path);
        if let Some(&inode) = self.path_to_inode.get(&normalized) {
            return inode;
        }
        let inode = self.next_inode;
        self.next_inode += 1;
        self.path_to_inode.insert(normalized.clone(), inode);
        self.inode_to_path.insert(inode, normalized);
        inode
    }

    pub fn get_path(&self, inode: u64) -> Option<&str> {
        self.inode_to_path.get(&inode).map(String::as_str)
    }

    pub fn remove_by_path(&mut self, path: &str) -> Option<u64> {
        let normalized = normalize_path(path);
        let inode = self.path_to_inode.remove(&normalized)?;
        self.inode_to_path.remove(&inode);
        Some(inode)
    }

    /// Moves a path to a new name, keeping its inode stable.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Option<u64> {
        let old = normalize_path(old_path);
        let new = normalize_path(new_path);
        let inode = self.path_to_inode.remove(&old)?;
        // A rename over an existing destination drops the old target inode.
        if let Some(evicted) = self.path_to_inode.remove(&new) {
            self.inode_to_path.remove(&evicted);
        }
        self.inode_to_path.insert(inode, new.clone());
        self.path_to_inode.insert(new, inode);
        Some(inode)
    }

    /// Applies a directory rename to every mapped descendant.
    pub fn rename_prefix(&mut self, old_prefix: &str, new_prefix: &str) {
        let old = normalize_path(old_prefix);
        let new = normalize_path(new_prefix);
        let moved: Vec<String> = self
            .path_to_inode
            .keys()
            .filter(|p| p.as_str() == old || p.starts_with(&format!("{}/", old)))
            .cloned()
            .collect();
        for path in moved {
            let suffix = &path[old.len()..];
            self.rename(&path, &format!("{}{}", new, suffix));
        }
    }
}

fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }
    let mut normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_preregistered() {
        let table = InodeTable::new();
        assert_eq!(table.get_path(InodeTable::ROOT_INODE), Some("/"));
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let mut table = InodeTable::new();
        let a = table.get_or_create("/a.txt");
        let b = table.get_or_create("/b.txt");
        assert_ne!(a, b);
        assert_eq!(table.get_or_create("/a.txt"), a);
        assert_eq!(table.get_or_create("a.txt"), a);
    }

    #[test]
    fn test_rename_keeps_inode() {
        let mut table = InodeTable::new();
        let inode = table.get_or_create("/old.txt");
        assert_eq!(table.rename("/old.txt", "/new.txt"), Some(inode));
        assert_eq!(table.get_path(inode), Some("/new.txt"));
        assert_eq!(table.get_or_create("/new.txt"), inode);
    }

    #[test]
    fn test_rename_over_existing_evicts_target() {
        let mut table = InodeTable::new();
        let src = table.get_or_create("/src.txt");
        let dst = table.get_or_create("/dst.txt");
        table.rename("/src.txt", "/dst.txt");
        assert_eq!(table.get_or_create("/dst.txt"), src);
        assert_eq!(table.get_path(dst), None);
    }

    #[test]
    fn test_rename_prefix_moves_descendants() {
        let mut table = InodeTable::new();
        let dir = table.get_or_create("/docs");
        let file = table.get_or_create("/docs/sub/a.txt");
        table.rename_prefix("/docs", "/papers");
        assert_eq!(table.get_path(dir), Some("/papers"));
        assert_eq!(table.get_path(file), Some("/papers/sub/a.txt"));
    }
}
