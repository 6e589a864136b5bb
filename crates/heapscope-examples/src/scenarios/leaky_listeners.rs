use heapscope::{ObjId, ScriptHeap, SharedHeap};

use super::Settings;

// window.bus.listeners is an array that only ever grows: widgets are
// dropped from window.widgets but their listeners stay subscribed.
pub async fn run(settings: Settings) -> Result<(), String> {
    let heap = SharedHeap::default();
    let listeners = {
        let mut h = heap.write();
        setup(&mut h).map_err(|e| e.to_string())?
    };

    println!("every tick mounts a Widget, subscribes a Listener and unmounts the Widget");
    println!("snapshot twice and diff to watch Listener and Widget grow");

    super::serve_until_ctrl_c(heap, settings, "Listener", move |heap, tick| {
        let mut h = heap.write();
        if let Err(e) = mount_and_forget(&mut h, listeners, tick) {
            tracing::warn!(%e, tick, "demo step failed");
        }
    })
    .await
}

fn setup(heap: &mut ScriptHeap) -> Result<ObjId, heapscope::HeapError> {
    let root = heap.global();
    let bus = heap.alloc_here("EventBus");
    let listeners = heap.alloc_array_here();
    heap.set(bus, "listeners", listeners)?;
    heap.set(root, "bus", bus)?;
    let widgets = heap.alloc_here("WidgetRegistry");
    heap.set(root, "widgets", widgets)?;
    Ok(listeners)
}

fn mount_and_forget(
    heap: &mut ScriptHeap,
    listeners: ObjId,
    tick: u64,
) -> Result<(), heapscope::HeapError> {
    let root = heap.global();
    let widget = heap.alloc_here("Widget");
    heap.set(widget, "id", tick as f64)?;
    let listener = heap.alloc_here("Listener");
    heap.set(listener, "owner", widget)?;
    heap.push(listeners, listener)?;

    // Short-lived garbage, reclaimed by the next forced collection.
    for _ in 0..3 {
        let event = heap.alloc_here("Event");
        heap.set(event, "target", widget)?;
    }

    if let Some(heapscope::Value::Ref(registry)) = heap.get_property(root, "widgets").cloned() {
        let key = format!("w{tick}");
        heap.set(registry, &key, widget)?;
        heap.remove(registry, &key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_keep_unmounted_widgets_alive() {
        let mut heap = ScriptHeap::new();
        let listeners = setup(&mut heap).expect("setup");
        for tick in 0..4 {
            mount_and_forget(&mut heap, listeners, tick).expect("step");
        }
        heap.collect();

        let count = |name: &str| {
            heap.census_counts()
                .into_iter()
                .find(|c| c.type_name == name)
                .map_or(0, |c| c.count)
        };
        assert_eq!(count("Widget"), 4);
        assert_eq!(count("Listener"), 4);
        assert_eq!(count("Event"), 0);
    }
}
