use std::thread;
use std::time::{Duration, Instant};

use openworkers_heap_tags::AgentConfig;
use openworkers_heap_tags::sim::{self, SimValue};

fn main() {
    env_logger::init();

    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    println!("=== Heap tag simulation ===");
    let (host, agent) = sim::launch(config);

    let start = Instant::now();
    for round in 0..10 {
        let objects: Vec<_> = (0..1_000).map(|_| host.alloc()).collect();
        for (i, object) in objects.iter().enumerate() {
            agent.set_tag(Some(object), Some(&SimValue::new(&format!("{round}-{i}"))));
            if i % 10 == 0 {
                agent.set_tag(Some(object), None);
            }
        }
        for object in &objects {
            host.unroot(object);
        }
        let freed = host.collect();
        println!("Round {}: collected {} objects", round, freed);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while agent.stats().pending > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    let stats = agent.stats();
    println!("Finished in {:?}", start.elapsed());
    println!(
        "allocated={} released={} live={} gc_cycles={} sweeps={}",
        stats.allocated, stats.released, stats.live, stats.gc_cycles, stats.sweeps
    );

    host.kill_vm();
    agent.shutdown();
}
