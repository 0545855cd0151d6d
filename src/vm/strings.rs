//! Interned file paths.
//!
//! Every [`FilePage`](super::file_page::FilePage) names its backing file by
//! path. Thousands of pages share a handful of paths, so each distinct path
//! is stored once and reference-counted by [`InternedStr`] handles.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::cmp::Ordering;
use core::hash::{Hash, Hasher};
use core::ops::Deref;
use spin::Mutex;

use crate::config::MAX_PATH_LEN;
use crate::error::VmError;

type Counts = Mutex<BTreeMap<Arc<str>, usize>>;

/// Reference-counted string interning pool. Leaf lock.
pub struct StringPool {
    strings: Arc<Counts>,
}

impl StringPool {
    pub fn new() -> Self {
        StringPool {
            strings: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Intern `s`, sharing storage with earlier handles for the same text.
    pub fn intern(&self, s: &str) -> Result<InternedStr, VmError> {
        if s.len() > MAX_PATH_LEN {
            return Err(VmError::PathTooLong);
        }

        let mut strings = self.strings.lock();
        let text = match strings.get_key_value(s) {
            Some((text, _)) => text.clone(),
            None => Arc::from(s),
        };
        *strings.entry(text.clone()).or_insert(0) += 1;

        Ok(InternedStr {
            text,
            pool: self.strings.clone(),
        })
    }

    /// Number of distinct live strings.
    pub fn len(&self) -> usize {
        self.strings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live handles for `s`.
    pub fn refs(&self, s: &str) -> usize {
        self.strings.lock().get(s).copied().unwrap_or(0)
    }

    /// Log every interned string with its handle count.
    pub fn dump(&self) {
        let strings = self.strings.lock();
        log::info!("[VM] Strings pool ({} entries)", strings.len());
        for (text, refs) in strings.iter() {
            log::info!("[VM]   (string={}, refs={})", text, refs);
        }
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an interned string. Dropping the last handle frees the text.
pub struct InternedStr {
    text: Arc<str>,
    pool: Arc<Counts>,
}

impl InternedStr {
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl Clone for InternedStr {
    fn clone(&self) -> Self {
        if let Some(refs) = self.pool.lock().get_mut(&*self.text) {
            *refs += 1;
        }
        InternedStr {
            text: self.text.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl Drop for InternedStr {
    fn drop(&mut self) {
        let mut strings = self.pool.lock();
        if let Some(refs) = strings.get_mut(&*self.text) {
            *refs -= 1;
            if *refs == 0 {
                strings.remove(&*self.text);
            }
        }
    }
}

impl Deref for InternedStr {
    type Target = str;

    fn deref(&self) -> &str {
        &self.text
    }
}

impl PartialEq for InternedStr {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for InternedStr {}

impl PartialOrd for InternedStr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternedStr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.text.cmp(&other.text)
    }
}

impl Hash for InternedStr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

impl core::fmt::Debug for InternedStr {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{:?}", &*self.text)
    }
}

impl core::fmt::Display for InternedStr {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;

    #[test]
    fn same_text_shares_storage() {
        let pool = StringPool::new();
        let a = pool.intern("/bin/echo").unwrap();
        let b = pool.intern("/bin/echo").unwrap();
        assert!(core::ptr::eq(a.as_str().as_ptr(), b.as_str().as_ptr()));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.refs("/bin/echo"), 2);
    }

    #[test]
    fn last_handle_frees_the_string() {
        let pool = StringPool::new();
        let a = pool.intern("/bin/echo").unwrap();
        let b = a.clone();
        assert_eq!(pool.refs("/bin/echo"), 2);
        drop(a);
        assert_eq!(pool.refs("/bin/echo"), 1);
        drop(b);
        assert!(pool.is_empty());
    }

    #[test]
    fn page_sized_paths_are_rejected() {
        let pool = StringPool::new();
        let long: String = core::iter::repeat('a').take(MAX_PATH_LEN + 1).collect();
        assert_eq!(pool.intern(&long).err(), Some(VmError::PathTooLong));
        assert!(pool.is_empty());
    }
}
