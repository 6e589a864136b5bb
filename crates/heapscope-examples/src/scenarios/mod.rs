use std::sync::Arc;
use std::time::Duration;

use heapscope::{MemoryService, ServiceConfig, SharedHeap, log_instance_counts, log_instances};

pub mod cyclic_scene;
pub mod leaky_listeners;

pub struct Settings {
    pub service: ServiceConfig,
    pub tick: Duration,
}

/// Serves `heap`, calls `step` on every tick and stops the service on Ctrl+C.
/// Every tenth tick logs the census and the instances of `leaking_type`.
pub(crate) async fn serve_until_ctrl_c(
    heap: SharedHeap,
    settings: Settings,
    leaking_type: &str,
    mut step: impl FnMut(&SharedHeap, u64),
) -> Result<(), String> {
    let mut service = MemoryService::new(Arc::new(heap.clone()), settings.service);
    let local_addr = service
        .start(heap.global())
        .await
        .map_err(|e| e.to_string())?;

    println!("serving heap on {local_addr}");
    println!("try: HEAPSCOPE_ADDR={local_addr} heapscope-dump counts");
    println!("press Ctrl+C to exit");

    let mut ticker = tokio::time::interval(settings.tick);
    let mut tick = 0_u64;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let outcome = loop {
        tokio::select! {
            res = &mut ctrl_c => {
                break res.map_err(|e| format!("failed waiting for Ctrl+C: {e}"));
            }
            _ = ticker.tick() => {
                step(&heap, tick);
                tick += 1;
                if tick % 10 == 0 {
                    log_instance_counts(&heap);
                    log_instances(&heap, leaking_type);
                }
            }
        }
    };

    service.stop().await;
    outcome
}
