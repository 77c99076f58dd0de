//! The ordering/visibility engine — the MCM. `spec.md` §4.6.
//!
//! Two mechanisms satisfy the model: delivery-complete (a successful CQ
//! wait already implies target visibility, so there is nothing further to
//! do) and message-order (issue a dummy GET from the peer whose completion
//! implies the prior PUT landed, since the provider guarantees per-pair
//! ordering). `Fabric::delivery_complete()` selects which applies.
//!
//! The order-dummy region (`spec.md` §3) is the first
//! [`ORDER_DUMMY_SIZE`] bytes of every node's heap — it rides on the same
//! registered-heap MR as user data rather than needing a second
//! registration and a second OOB exchange, since `spec.md` only requires
//! it be "replicated and registered", not registered *separately*. The
//! heap allocator is expected to hand `comm-core` a region whose first 4
//! bytes it never allocates to user PUT/GET/AMO targets; `node.rs` enforces
//! this by only ever exposing `[ORDER_DUMMY_SIZE, heap.size())` to callers.

use anyhow::Result;

use crate::fabric::Fabric;
use crate::mr::MrTable;
use crate::task::Tasking;
use crate::types::NodeId;

pub const ORDER_DUMMY_OFFSET: u64 = 0;
pub const ORDER_DUMMY_SIZE: u64 = 4;

pub(crate) fn dummy_get(fabric: &dyn Fabric, mr: &MrTable, peer: NodeId) -> Result<()> {
    let (key, offset) = mr
        .mr_get_key(peer, ORDER_DUMMY_OFFSET, ORDER_DUMMY_SIZE)
        .expect("every peer registers its order-dummy region as part of its heap MR");
    let mut scratch = [0u8; ORDER_DUMMY_SIZE as usize];
    fabric.read(peer, &mut scratch, offset, key)
}

/// Records that a task issued an injected PUT to `peer` whose completion
/// hasn't been forced visible yet. Only meaningful in MO mode on a bound
/// context (`spec.md` §4.6: "only needed in MO mode and only for bound
/// transmit contexts"); callers elsewhere should not call this at all, so
/// there's no `delivery_complete` check here — the RDMA engine (`rdma.rs`)
/// is responsible for only taking the injected-PUT branch in MO mode.
pub fn note_injected_put(tasking: &dyn Tasking, node_count: usize, peer: NodeId) {
    tasking.task_private_slot(&mut |tp| {
        let bm = tp.put_bitmap.get_or_insert_with(|| crate::bitmap::Bitmap::new(node_count));
        bm.set(peer);
    });
}

/// A real GET from `peer` already implies any prior PUT to `peer` is
/// visible there, so `rdma.rs`'s `ofi_get` just drops the bookkeeping
/// without issuing a second dummy GET (`spec.md` §4.3: "this GET subsumes
/// prior PUT visibility to that peer").
pub fn clear_pending_put(tasking: &dyn Tasking, peer: NodeId) {
    tasking.task_private_slot(&mut |tp| {
        if let Some(bm) = tp.put_bitmap.as_mut() {
            bm.clear(peer);
        }
    });
}

/// `wait_puts_vis_one_node`: force visibility of any pending PUT to `peer`.
pub fn wait_puts_vis_one_node(fabric: &dyn Fabric, mr: &MrTable, tasking: &dyn Tasking, peer: NodeId) -> Result<()> {
    if fabric.delivery_complete() {
        return Ok(());
    }
    let needs_dummy = tasking.task_private_slot(&mut |tp| match tp.put_bitmap.as_mut() {
        Some(bm) if bm.is_set(peer) => {
            bm.clear(peer);
            true
        }
        _ => false,
    });
    if needs_dummy {
        dummy_get(fabric, mr, peer)?;
    }
    Ok(())
}

/// `wait_puts_vis_all_nodes`: force visibility of every pending PUT.
/// Called before `executeOn`/mutating network AMOs and at task end
/// (`spec.md` §4.6's "when the engine forces visibility" list).
pub fn wait_puts_vis_all_nodes(fabric: &dyn Fabric, mr: &MrTable, tasking: &dyn Tasking, task_ending: bool) -> Result<()> {
    if fabric.delivery_complete() {
        if task_ending {
            tasking.task_private_slot(&mut |tp| tp.put_bitmap = None);
        }
        return Ok(());
    }
    let pending: Vec<NodeId> = tasking.task_private_slot(&mut |tp| {
        tp.put_bitmap.as_ref().map(|bm| bm.iter_set().collect()).unwrap_or_default()
    });
    for peer in pending {
        dummy_get(fabric, mr, peer)?;
    }
    tasking.task_private_slot(&mut |tp| {
        if task_ending {
            tp.put_bitmap = None;
        } else if let Some(bm) = tp.put_bitmap.as_mut() {
            bm.clear_all();
        }
    });
    Ok(())
}
