use std::sync::Arc;

use heapscope::{MemoryService, ObjId, ScriptHeap, ServiceConfig, SharedHeap};
use heapscope_types::TypeDelta;

use crate::{
    CaptureOptions, ClientError, MemoryProxy, capture_snapshot, diff, load_snapshot,
    save_snapshot,
};

fn local_config() -> ServiceConfig {
    ServiceConfig {
        listen_addr: "127.0.0.1:0".into(),
        ..ServiceConfig::default()
    }
}

// window = { a: { b: 1 }, c: [ {}, { x: {} } ] }
fn scenario_heap() -> (SharedHeap, ObjId) {
    let mut heap = ScriptHeap::new();
    let root = heap.global();
    let a = heap.alloc_here("A");
    heap.set(a, "b", 1.0).expect("live");
    let c = heap.alloc_array_here();
    let c0 = heap.alloc_here("Item");
    let c1 = heap.alloc_here("Item");
    let x = heap.alloc_here("X");
    heap.set(c1, "x", x).expect("live");
    heap.push(c, c0).expect("sequence");
    heap.push(c, c1).expect("sequence");
    heap.set(root, "a", a).expect("live");
    heap.set(root, "c", c).expect("live");
    (SharedHeap::new(heap), x)
}

fn row<'a>(rows: &'a [TypeDelta], type_name: &str) -> Option<&'a TypeDelta> {
    rows.iter().find(|row| row.type_name == type_name)
}

#[tokio::test]
async fn proxy_resolves_census_addresses() {
    let (heap, x) = scenario_heap();
    let root = heap.global();
    let mut service = MemoryService::new(Arc::new(heap.clone()), local_config());
    let addr = service.start(root).await.expect("service should start");

    let mut proxy = MemoryProxy::connect(&addr.to_string())
        .await
        .expect("connect");
    let listed = proxy.get_objects("X").await.expect("list X");
    assert_eq!(listed.len(), 1);
    assert_eq!(Some(listed[0].address), heap.read().address_of(x));

    let path = proxy
        .find_object_path(listed[0].address)
        .await
        .expect("find path");
    assert_eq!(path, "window.c[1].x");

    let root_address = heap.read().address_of(root).expect("root is live");
    assert_eq!(
        proxy.find_object_path(root_address).await.expect("find path"),
        ""
    );
    assert!(proxy.get_objects("Nope").await.expect("list").is_empty());

    service.stop().await;
}

#[tokio::test]
async fn forced_collection_shrinks_the_census() {
    let (heap, _) = scenario_heap();
    {
        let mut h = heap.write();
        let root = h.global();
        let kept = h.alloc_here("Foo");
        h.alloc_here("Foo");
        h.alloc_here("Foo");
        h.set(root, "kept", kept).expect("live");
    }
    let mut service = MemoryService::new(Arc::new(heap.clone()), local_config());
    let addr = service
        .start(heap.global())
        .await
        .expect("service should start");
    let mut proxy = MemoryProxy::connect(&addr.to_string())
        .await
        .expect("connect");

    let before = capture_snapshot(
        &mut proxy,
        &CaptureOptions {
            collect_first: false,
        },
    )
    .await
    .expect("capture without gc");
    let after = capture_snapshot(&mut proxy, &CaptureOptions::default())
        .await
        .expect("capture with gc");

    assert_eq!(before.snapshot.instance_count("Foo"), 3);
    assert_eq!(after.snapshot.instance_count("Foo"), 1);
    let rows = diff(&before.snapshot, &after.snapshot);
    let foo = row(&rows, "Foo").expect("Foo row");
    assert!(foo.delta < 0, "collection should free Foo instances");
    assert_eq!(row(&rows, "X").map(|r| r.delta), Some(0));

    service.stop().await;
}

#[tokio::test]
async fn snapshots_of_a_growing_heap_diff_and_persist() {
    let (heap, _) = scenario_heap();
    let retain = |type_name: &str, key: &str| {
        let mut h = heap.write();
        let root = h.global();
        let object = h.alloc_here(type_name);
        h.set(root, key, object).expect("live");
    };
    retain("Foo", "foo0");
    retain("Foo", "foo1");

    let mut service = MemoryService::new(Arc::new(heap.clone()), local_config());
    let addr = service
        .start(heap.global())
        .await
        .expect("service should start");
    let mut proxy = MemoryProxy::connect(&addr.to_string())
        .await
        .expect("connect");

    let prior = capture_snapshot(&mut proxy, &CaptureOptions::default())
        .await
        .expect("prior capture");
    retain("Foo", "foo2");
    retain("Bar", "bar0");
    let current = capture_snapshot(&mut proxy, &CaptureOptions::default())
        .await
        .expect("current capture");
    assert!(prior.gaps.is_empty());
    assert!(current.gaps.is_empty());

    let dir = tempfile::tempdir().expect("tempdir");
    let prior_path = dir.path().join("prior.json");
    let current_path = dir.path().join("current.json");
    save_snapshot(&prior_path, &prior.snapshot).expect("save prior");
    save_snapshot(&current_path, &current.snapshot).expect("save current");
    let prior = load_snapshot(&prior_path).expect("load prior");
    let current = load_snapshot(&current_path).expect("load current");

    let rows = diff(&prior, &current);
    assert_eq!(
        row(&rows, "Foo").cloned(),
        Some(TypeDelta::new("Foo", 2, 3))
    );
    assert_eq!(
        row(&rows, "Bar").cloned(),
        Some(TypeDelta::new("Bar", 0, 1))
    );
    assert!(
        rows.iter()
            .filter(|row| row.type_name != "Foo" && row.type_name != "Bar")
            .all(|row| row.delta == 0)
    );

    service.stop().await;
}

#[tokio::test]
async fn stopped_service_is_unavailable() {
    let (heap, _) = scenario_heap();
    let mut service = MemoryService::new(Arc::new(heap.clone()), local_config());
    let addr = service
        .start(heap.global())
        .await
        .expect("service should start");
    service.stop().await;

    let Err(err) = MemoryProxy::connect(&addr.to_string()).await else {
        panic!("stopped service should refuse connections");
    };
    assert!(matches!(err, ClientError::Unavailable { .. }), "{err}");
}
