//! Conv-item caches
//!
//! The convenience entry points (`spawn`, `sync`, `after`, `repeating`)
//! allocate dispatcher-owned items. Retired ones park on a bounded per-type
//! free-list so steady-state dispatching stops allocating.

use crate::dispatch::{Dispatch, Inner};
use crate::item::{Item, ItemBody, ItemFlags};
use vdispatch_core::{ItemId, ItemState, ItemType};

/// Most conv items kept for reuse
pub(crate) const MAX_CONV_ITEM_CACHE: usize = 8;

/// Most conv timers kept for reuse
pub(crate) const MAX_CONV_TIMER_CACHE: usize = 4;

impl Dispatch {
    /// Pop a cached conv item of `ty`, or allocate a fresh one. The caller
    /// fills in body and flags.
    pub(crate) fn acquire_cached_conv_locked(&self, inner: &mut Inner, ty: ItemType) -> ItemId {
        let cache = match ty {
            ItemType::ConvItem => &mut inner.conv_item_cache,
            ItemType::ConvTimer => &mut inner.conv_timer_cache,
            _ => unreachable!("acquiring a cache slot for a non-cacheable item type"),
        };

        if let Some(item) = cache.pop() {
            if let Some(rec) = inner.items.get_mut(item.raw()) {
                rec.ty = ty;
                rec.subtype = 0;
                rec.flags = ItemFlags::empty();
                rec.state = ItemState::Idle;
                rec.body = ItemBody::Vacant;
            }
            item
        } else {
            ItemId::new(inner.items.insert(Item::new_conv(ty)))
        }
    }

    /// Return a conv item to its cache, or free it when the cache is full
    pub(crate) fn cache_item_locked(&self, inner: &mut Inner, item: ItemId) {
        let ty = match inner.items.get(item.raw()) {
            Some(rec) => rec.ty,
            None => return,
        };
        let (cache, bound) = match ty {
            ItemType::ConvItem => (&mut inner.conv_item_cache, MAX_CONV_ITEM_CACHE),
            ItemType::ConvTimer => (&mut inner.conv_timer_cache, MAX_CONV_TIMER_CACHE),
            _ => unreachable!("caching a user-owned item"),
        };

        if cache.len() < bound {
            cache.push(item);
            if let Some(rec) = inner.items.get_mut(item.raw()) {
                rec.subtype = 0;
                rec.flags = ItemFlags::empty();
                rec.state = ItemState::Idle;
                rec.body = ItemBody::Vacant;
            }
        } else {
            inner.items.remove(item.raw());
        }
    }
}
