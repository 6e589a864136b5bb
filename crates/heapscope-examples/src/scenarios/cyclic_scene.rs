use heapscope::{HeapError, ScriptHeap, SharedHeap, Value};

use super::Settings;

// Each tick replaces window.scene with a fresh parent/child cycle. Cycles
// alone are collectable; the leak is window.cache, which remembers the
// first child of every scene.
pub async fn run(settings: Settings) -> Result<(), String> {
    let heap = SharedHeap::default();
    {
        let mut h = heap.write();
        let root = h.global();
        let cache = h.alloc_array_here();
        h.set(root, "cache", cache).map_err(|e| e.to_string())?;
    }

    println!("every tick swaps in a new SceneNode tree; old trees should be collected");
    println!("find-path on a leaked SceneNode shows the cache holding it");

    super::serve_until_ctrl_c(heap, settings, "SceneNode", |heap, tick| {
        let mut h = heap.write();
        if let Err(e) = swap_scene(&mut h, tick) {
            tracing::warn!(%e, tick, "demo step failed");
        }
    })
    .await
}

fn swap_scene(heap: &mut ScriptHeap, tick: u64) -> Result<(), HeapError> {
    let root = heap.global();
    let parent = heap.alloc_here("SceneNode");
    let children = heap.alloc_array_here();
    heap.set(parent, "children", children)?;
    heap.set(parent, "frame", tick as f64)?;
    for _ in 0..3 {
        let child = heap.alloc_here("SceneNode");
        heap.set(child, "parent", parent)?;
        heap.push(children, child)?;
    }
    heap.set(root, "scene", parent)?;

    let cache = heap.get_property(root, "cache").cloned();
    let first = heap.get_property(children, "0").cloned();
    if let (Some(Value::Ref(cache)), Some(Value::Ref(first))) = (cache, first) {
        heap.push(cache, first)?;
    }
    Ok(())
}
