//! Demonstrates a bucket pacing a burst of jobs under two rates and a concurrency gate.
use std::time::Instant;
use uprate::{Bucket, Rate};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // At most 2 jobs in flight, 4 per second, 10 per 5 seconds.
    let bucket = Bucket::builder(Rate::per_second(4)? | Rate::SECOND.scaled_by(5.0)?.with_uses(10)?)
        .concurrency(2)
        .build()?;

    let start = Instant::now();
    let jobs = (0..12).map(|job| {
        let bucket = bucket.clone();
        tokio::spawn(async move {
            bucket
                .execute(&"reports", || async move {
                    println!("job {job:>2} started at {:>5.2}s", start.elapsed().as_secs_f64());
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                })
                .await
        })
    });

    for result in futures::future::join_all(jobs).await {
        result??;
    }
    println!("12 jobs done in {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}
