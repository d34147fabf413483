//! User extended attributes
//!
//! Attributes live on the path's metadata object next to the reserved
//! `poolfs.` attributes. Only names in the `usr.` and `sys.` namespaces are
//! accepted from callers, and only those are listed back.

use crate::dircache::DirCache;
use crate::entry::EntryMetadata;
use crate::resolver::Resolver;
use poolfs_common::{Error, FsPath, Result};
use poolfs_store::ObjectStore;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name prefixes open to callers
pub const USER_ATTR_PREFIXES: [&str; 2] = ["usr.", "sys."];

/// Check that `name` belongs to a caller-visible namespace
pub fn check_attr_name(name: &str) -> Result<()> {
    let valid = USER_ATTR_PREFIXES
        .iter()
        .any(|prefix| name.len() > prefix.len() && name.starts_with(prefix));
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!(
            "attribute name {name:?} must start with one of {USER_ATTR_PREFIXES:?}"
        )))
    }
}

/// Get/set/remove/list attributes on the object backing a path
pub struct AttributeStore {
    store: Arc<dyn ObjectStore>,
    resolver: Arc<Resolver>,
    cache: Arc<DirCache>,
}

impl AttributeStore {
    pub fn new(store: Arc<dyn ObjectStore>, resolver: Arc<Resolver>, cache: Arc<DirCache>) -> Self {
        Self {
            store,
            resolver,
            cache,
        }
    }

    fn owner(&self, path: &FsPath) -> Result<Arc<EntryMetadata>> {
        self.resolver.lookup(path)
    }

    /// Map a missing metadata object to a missing path
    fn on_path(path: &FsPath, err: Error) -> Error {
        match err {
            Error::ObjectNotFound { .. } => Error::PathNotFound(path.to_string()),
            other => other,
        }
    }

    pub fn set_xattr(&self, path: &FsPath, name: &str, value: &str) -> Result<()> {
        check_attr_name(name)?;
        let entry = self.owner(path)?;
        self.store
            .set_xattr(&entry.metadata_pool, path.as_str(), name, value.as_bytes())
            .map_err(|e| Self::on_path(path, e))?;
        self.cache.invalidate(path.as_str());
        Ok(())
    }

    /// Read an attribute, failing with `Truncated` if it exceeds `max_len`
    pub fn get_xattr(&self, path: &FsPath, name: &str, max_len: usize) -> Result<String> {
        check_attr_name(name)?;
        let entry = self.owner(path)?;
        let raw = self
            .store
            .get_xattr(&entry.metadata_pool, path.as_str(), name)
            .map_err(|e| Self::on_path(path, e))?;
        if raw.len() > max_len {
            return Err(Error::Truncated {
                name: name.to_string(),
                len: raw.len(),
                max_len,
            });
        }
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::internal(format!("attribute {name} on {path} is not UTF-8")))
    }

    pub fn remove_xattr(&self, path: &FsPath, name: &str) -> Result<()> {
        check_attr_name(name)?;
        let entry = self.owner(path)?;
        self.store
            .remove_xattr(&entry.metadata_pool, path.as_str(), name)
            .map_err(|e| Self::on_path(path, e))?;
        self.cache.invalidate(path.as_str());
        Ok(())
    }

    /// All caller-visible attributes of a path
    pub fn xattrs(&self, path: &FsPath) -> Result<BTreeMap<String, String>> {
        let entry = self.owner(path)?;
        let attrs = self
            .store
            .list_xattrs(&entry.metadata_pool, path.as_str())
            .map_err(|e| Self::on_path(path, e))?;
        Ok(attrs
            .into_iter()
            .filter(|(name, _)| check_attr_name(name).is_ok())
            .map(|(name, value)| (name, String::from_utf8_lossy(&value).into_owned()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_name_namespaces() {
        assert!(check_attr_name("usr.color").is_ok());
        assert!(check_attr_name("sys.acl").is_ok());
        assert!(check_attr_name("usr.").is_err());
        assert!(check_attr_name("poolfs.inode").is_err());
        assert!(matches!(
            check_attr_name("color"),
            Err(Error::InvalidArgument(_))
        ));
    }
}
