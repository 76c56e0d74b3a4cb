use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use openworkers_heap_tags::sim::{self, SimHost};
use openworkers_heap_tags::{AgentConfig, TagAgent};

/// Launches an agent in a live simulated host.
#[allow(dead_code)]
pub fn launch() -> (Arc<SimHost>, Arc<TagAgent<SimHost>>) {
    sim::launch(AgentConfig::default())
}

/// Polls `condition` until it holds or five seconds pass.
///
/// The sweep worker runs asynchronously after a collection, so tests wait for
/// its effects rather than sleeping a fixed amount.
#[allow(dead_code)]
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
