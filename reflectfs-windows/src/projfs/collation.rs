use std::cmp::Ordering;
use reflectfs_core::naming::{is_match_all, NameCollation};
use windows::core::{HSTRING, PCWSTR};
use super::library::{library, ProjFsLibrary};
use crate::error::WindowsResult;

/// Name collation backed by the ProjFS routines, so enumeration order and
/// filtering agree with the engine.
#[derive(Debug, Clone, Copy)]
pub struct ProjFsCollation {
    api: &'static ProjFsLibrary,
}

impl ProjFsCollation {
    pub fn new() -> WindowsResult<Self> {
        Ok(Self { api: library()? })
    }
}

impl NameCollation for ProjFsCollation {
    fn compare(&self, a: &str, b: &str) -> Ordering {
        let (a, b) = (HSTRING::from(a), HSTRING::from(b));
        let result = unsafe { (self.api.file_name_compare)(PCWSTR(a.as_ptr()), PCWSTR(b.as_ptr())) };
        result.cmp(&0)
    }

    fn matches(&self, name: &str, pattern: &str) -> bool {
        if is_match_all(pattern) {
            return true;
        }
        let (name, pattern) = (HSTRING::from(name), HSTRING::from(pattern));
        unsafe { (self.api.file_name_match)(PCWSTR(name.as_ptr()), PCWSTR(pattern.as_ptr())) }.as_bool()
    }

    fn is_wildcard(&self, pattern: &str) -> bool {
        let pattern = HSTRING::from(pattern);
        unsafe { (self.api.contains_wild_cards)(PCWSTR(pattern.as_ptr())) }.as_bool()
    }
}
