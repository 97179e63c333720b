//! Supplemental page table: the per-process map from page-aligned user
//! virtual address to page descriptor.

use crate::mem::page::Page;
use crate::mem::vm_error::{Result, VmError};
use crate::sync::mutex::Mutex;
use alloc::collections::btree_map::Entry;
use alloc::{collections::BTreeMap, sync::Arc, sync::Weak};
use marrowos_shared::mem::page_round_down;

/// Shared handle to a page descriptor. The SPT holds the owning reference;
/// the frame table refers to resident pages through a [`PageWeak`].
pub type PageRef = Arc<Mutex<Page>>;
pub type PageWeak = Weak<Mutex<Page>>;

#[derive(Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<usize, PageRef>,
}

impl SupplementalPageTable {
    pub fn new() -> SupplementalPageTable {
        Default::default()
    }

    /// Returns the descriptor covering `va`, which need not be page-aligned.
    pub fn find(&self, va: usize) -> Option<PageRef> {
        self.pages.get(&page_round_down(va)).cloned()
    }

    /// Inserts a fresh descriptor, keyed by its page address.
    pub fn insert(&mut self, page: Page) -> Result<PageRef> {
        match self.pages.entry(page.va()) {
            Entry::Occupied(_) => Err(VmError::AlreadyMapped),
            Entry::Vacant(v) => {
                let page = Arc::new(Mutex::new(page));
                v.insert(page.clone());
                Ok(page)
            }
        }
    }

    /// Detaches the descriptor for `va`. The caller is responsible for
    /// destroying it.
    pub fn remove(&mut self, va: usize) -> Option<PageRef> {
        self.pages.remove(&page_round_down(va))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, PageRef)> + '_ {
        self.pages.iter().map(|(&va, page)| (va, page.clone()))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.pages.clear();
    }
}
