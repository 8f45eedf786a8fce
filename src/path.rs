//! 路径解析。
//!
//! 逐个路径分量向下查找：先锁住当前目录、查到子 inode 编号、放开当前目录，再处理下一个分量。
//! 任何时刻最多只锁一个目录，因此 ".." 不会造成死锁。

use crate::block_cache::OpContext;
use crate::inode::{Inode, InodeTree};
use crate::layout::{InodeType, ROOT_INODE_NO};
use alloc::{string::String, sync::Arc};

/// Split the next element off `path`, skipping surrounding slashes.
///
/// Returns `(element, rest)`, or `None` when no element is left.
fn skip_elem(path: &str) -> Option<(&str, &str)> {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return None;
    }
    let end = path.find('/').unwrap_or(path.len());
    let (name, rest) = path.split_at(end);
    Some((name, rest.trim_start_matches('/')))
}

impl InodeTree {
    fn namex(
        &self,
        ctx: &OpContext,
        path: &str,
        cwd: Option<&Arc<Inode>>,
        parent: bool,
    ) -> Option<(Arc<Inode>, String)> {
        let mut ip = match cwd {
            Some(cwd) if !path.starts_with('/') => self.share(cwd),
            _ => self.get(ROOT_INODE_NO),
        };
        let mut path = path;
        while let Some((name, rest)) = skip_elem(path) {
            path = rest;
            let dir = self.lock(&ip);
            if dir.kind() != InodeType::Directory {
                drop(dir);
                self.put(ctx, ip);
                return None;
            }
            if parent && rest.is_empty() {
                // 提前一层停下。
                drop(dir);
                return Some((ip, String::from(name)));
            }
            if name == "." {
                continue;
            }
            let Some((inode_no, _)) = dir.lookup(name) else {
                drop(dir);
                self.put(ctx, ip);
                return None;
            };
            let next = self.get(inode_no);
            drop(dir);
            self.put(ctx, ip);
            ip = next;
        }
        if parent {
            self.put(ctx, ip);
            return None;
        }
        Some((ip, String::new()))
    }

    /// Resolve `path` to an inode reference.
    ///
    /// Absolute paths start at the root, relative ones at `cwd` (the root
    /// when `cwd` is `None`). `None` if some element is missing or a
    /// non-directory is traversed.
    pub fn namei(&self, ctx: &OpContext, path: &str, cwd: Option<&Arc<Inode>>) -> Option<Arc<Inode>> {
        self.namex(ctx, path, cwd, false).map(|(ip, _)| ip)
    }

    /// Resolve the parent directory of `path`, returning it with the final
    /// element's name. `None` for paths without a final element, like "/".
    pub fn nameiparent(
        &self,
        ctx: &OpContext,
        path: &str,
        cwd: Option<&Arc<Inode>>,
    ) -> Option<(Arc<Inode>, String)> {
        self.namex(ctx, path, cwd, true)
    }
}

#[cfg(test)]
mod tests {
    use super::skip_elem;

    #[test]
    fn split_elements() {
        assert_eq!(skip_elem("a/bb/c"), Some(("a", "bb/c")));
        assert_eq!(skip_elem("///a//bb"), Some(("a", "bb")));
        assert_eq!(skip_elem("a"), Some(("a", "")));
        assert_eq!(skip_elem(""), None);
        assert_eq!(skip_elem("////"), None);
    }
}
