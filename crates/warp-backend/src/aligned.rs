//! Aligned extent queries
//!
//! Filters that expose a coarser block size than the backend below them
//! need the first reported extent to be a whole number of blocks.
//! [`extents_aligned`] queries the next layer and merges or trims the
//! head of the result until it is.

use crate::dispatch::Layer;
use crate::error::{BackendError, BackendResult};
use crate::extent::Extents;
use crate::flags::RequestFlags;

/// Query extents from `next` so that the first entry of `extents` has a
/// length that is a multiple of `align`
///
/// `count` and `offset` must already be multiples of `align`. Only the
/// first entry is guaranteed aligned; the caller re-queries for the
/// rest. Merged entries take the intersection of their types, so a
/// hole or zero bit is kept only if it holds for every merged range.
pub fn extents_aligned(
    next: &mut Layer<'_>,
    count: u32,
    offset: u64,
    flags: RequestFlags,
    align: u32,
    extents: &mut Extents,
) -> BackendResult<()> {
    let align = u64::from(align);
    if align == 0 || (u64::from(count) | offset) % align != 0 {
        return Err(BackendError::Range(format!(
            "count {count} and offset {offset} must be aligned to {align}"
        )));
    }

    next.extents(count, offset, flags, extents)?;

    let Some(i) = extents.iter().position(|e| e.length % align != 0) else {
        return Ok(());
    };
    let Some(mut head) = extents.get(i) else {
        return Ok(());
    };

    // Misalignment past the first block: round down and drop the rest
    if head.end() > offset + align {
        head.length -= head.length % align;
        if let Some(e) = extents.get_mut(i) {
            e.length = head.length;
        }
        extents.truncate(i + usize::from(head.length > 0));
        return Ok(());
    }

    // Any entry before i would be at least one block long, so the short
    // entry is the first one
    while head.length < align {
        if extents.len() > 1 {
            let e = extents.remove(1);
            head.length += e.length;
            head.ty = head.ty.intersect(e.ty);
        } else {
            let gap = align - head.length;
            let mut more =
                Extents::with_limit(head.end(), offset + align, next.chain().config().max_extents)?;
            next.extents(
                gap as u32,
                head.end(),
                flags.without(RequestFlags::REQ_ONE),
                &mut more,
            )?;

            let mut entries = more.into_vec();
            let Some(first) = entries.first_mut() else {
                return Err(BackendError::Range(format!(
                    "no extents returned for [{}, {})",
                    head.end(),
                    offset + align
                )));
            };
            head.length += first.length;
            head.ty = head.ty.intersect(first.ty);
            *first = head;
            extents.replace(entries);
        }
        if let Some(e) = extents.first_mut() {
            *e = head;
        }
    }

    head.length = align;
    if let Some(e) = extents.first_mut() {
        *e = head;
    }
    extents.truncate(1);
    Ok(())
}
