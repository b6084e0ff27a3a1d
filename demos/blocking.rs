//! Demonstrates the thread-blocking bucket shared by worker threads.
use std::time::Instant;
use uprate::{BlockingBucket, Bucket, Rate};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let bucket: BlockingBucket<&str> =
        Bucket::builder(Rate::per_second(5)?).concurrency(3).build_blocking()?;

    let start = Instant::now();
    std::thread::scope(|scope| {
        for worker in 0..4 {
            let bucket = &bucket;
            scope.spawn(move || {
                for call in 0..3 {
                    let outcome = bucket.execute(&"upstream-api", || {
                        println!(
                            "worker {worker} call {call} at {:.2}s",
                            start.elapsed().as_secs_f64()
                        );
                    });
                    if let Err(err) = outcome {
                        eprintln!("worker {worker} gave up: {err}");
                    }
                }
            });
        }
    });
    Ok(())
}
