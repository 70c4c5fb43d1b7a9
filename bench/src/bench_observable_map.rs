use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Barrier;
use std::thread;
use std::time::Instant;

use dashmap::DashMap;
use obsmap::{
    ConcurrentMap, MapOptions, ObservableConcurrentMap, ObservableMap, StripedHashMap,
};
use rand::{distributions::Alphanumeric, Rng};
use tracing::info;
use tracing_subscriber::EnvFilter;

const NUM_SHARDS: usize = 128;
const NUM_ITEMS: usize = 2_000_000;
const NUM_THREADS: usize = 8;

macro_rules! bench {
    ($name: expr, $body: expr) => {
        let now = Instant::now();
        $body;
        let elapsed = now.elapsed();
        println!("{} elapsed: {:.2?}", $name, elapsed);
    };
}

fn make_random_string() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(7)
        .map(char::from)
        .collect()
}

fn make_random_string_pairs(n: usize) -> Vec<(String, String)> {
    (0..n)
        .map(|_| (make_random_string(), make_random_string()))
        .collect()
}

fn partition_data<T>(data: Vec<T>, num_partitions: usize) -> Vec<Vec<T>> {
    let partition_sz = (data.len() / num_partitions.max(1)).max(1);
    let mut out = Vec::new();
    let mut buf = Vec::with_capacity(partition_sz);
    for item in data {
        buf.push(item);
        if buf.len() == partition_sz {
            out.push(std::mem::replace(&mut buf, Vec::with_capacity(partition_sz)));
        }
    }
    if !buf.is_empty() {
        out.push(buf);
    }
    out
}

fn sharded_options() -> MapOptions {
    MapOptions::new()
        .with_capacity(NUM_ITEMS)
        .with_shard_amount(NUM_SHARDS)
}

/// Counts delivered events so the notification path is not optimised away.
fn counted<M>(map: ObservableMap<M>) -> (ObservableMap<M>, Arc<AtomicUsize>)
where
    M: ConcurrentMap,
{
    let events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&events);
    map.subscribe_changed(move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    (map, events)
}

/// Runs `work` on every partition in its own thread and times the span
/// between all threads starting and all threads finishing.
fn run_threads<T, F>(name: &str, partitions: Vec<Vec<T>>, work: F)
where
    T: Send + 'static,
    F: Fn(Vec<T>) + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let start_barr = Arc::new(Barrier::new(partitions.len() + 1));
    let end_barr = Arc::new(Barrier::new(partitions.len() + 1));

    let mut handles = Vec::new();
    for data in partitions {
        let work = Arc::clone(&work);
        let t_start_barr = start_barr.clone();
        let t_end_barr = end_barr.clone();
        handles.push(thread::spawn(move || {
            t_start_barr.wait();
            work(data);
            t_end_barr.wait();
        }));
    }

    start_barr.wait();
    let now = Instant::now();
    end_barr.wait();
    println!("{} multithreaded elapsed: {:.2?}", name, now.elapsed());

    for h in handles {
        h.join().unwrap();
    }
}

fn bench_single_threaded<K, V>(src: &[(K, V)])
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    println!("bench single threaded");

    let dmap_data = src.to_vec();
    bench!("DashMap", {
        let map = DashMap::with_shard_amount(NUM_SHARDS);
        for (key, val) in dmap_data {
            map.insert(key, val);
        }
    });

    let sharded_data = src.to_vec();
    let (map, events) = counted(ObservableConcurrentMap::with_options(sharded_options()).unwrap());
    bench!("ObservableMap<ShardedMap>", {
        for (key, val) in sharded_data {
            map.try_add(key, val);
        }
    });
    info!(events = events.load(Ordering::Relaxed), "sharded events delivered");

    let striped_data = src.to_vec();
    let striped = StripedHashMap::with_options(sharded_options()).unwrap();
    let (map, events) = counted(ObservableMap::from_map(striped));
    bench!("ObservableMap<StripedHashMap>", {
        for (key, val) in striped_data {
            map.try_add(key, val);
        }
    });
    info!(events = events.load(Ordering::Relaxed), "striped events delivered");
}

fn bench_multi_threaded<K, V>(num_threads: usize, src: &[(K, V)])
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    println!("bench multi threaded");

    let dmap = Arc::new(DashMap::with_shard_amount(NUM_SHARDS));
    run_threads("DashMap", partition_data(src.to_vec(), num_threads), move |data| {
        for (key, val) in data {
            dmap.insert(key, val);
        }
    });

    let (map, events) = counted(ObservableConcurrentMap::with_options(sharded_options()).unwrap());
    let map = Arc::new(map);
    let tmap = Arc::clone(&map);
    run_threads(
        "ObservableMap<ShardedMap>",
        partition_data(src.to_vec(), num_threads),
        move |data| {
            for (key, val) in data {
                tmap.try_add(key, val);
            }
        },
    );
    info!(events = events.load(Ordering::Relaxed), len = map.len(), "sharded run done");

    let striped = StripedHashMap::with_options(sharded_options()).unwrap();
    let (map, events) = counted(ObservableMap::from_map(striped));
    let map = Arc::new(map);
    let tmap = Arc::clone(&map);
    run_threads(
        "ObservableMap<StripedHashMap>",
        partition_data(src.to_vec(), num_threads),
        move |data| {
            for (key, val) in data {
                tmap.try_add(key, val);
            }
        },
    );
    info!(events = events.load(Ordering::Relaxed), len = map.len(), "striped run done");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let input = make_random_string_pairs(NUM_ITEMS);
    bench_single_threaded(&input);
    bench_multi_threaded(NUM_THREADS, &input);
}
