//! Demonstrates per-tenant tower middleware: fail fast vs. wait.
use std::convert::Infallible;
use std::sync::Arc;
use tower::{service_fn, ServiceBuilder, ServiceExt};
use uprate::{Bucket, BucketLayer, Rate, RateLimit, RateLimitLayer};

#[derive(Debug)]
struct Request {
    tenant: &'static str,
}

async fn handle(req: Request) -> Result<String, Infallible> {
    Ok(format!("hello {}", req.tenant))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let limit = Arc::new(RateLimit::new(Rate::per_minute(2)?)?);
    let strict = ServiceBuilder::new()
        .layer(RateLimitLayer::new(limit, |req: &Request| req.tenant))
        .service_fn(handle);

    for _ in 0..3 {
        match strict.clone().oneshot(Request { tenant: "acme" }).await {
            Ok(body) => println!("strict: {body}"),
            Err(err) => println!("strict: rejected ({err})"),
        }
    }

    let bucket = Bucket::builder(Rate::per_second(2)?).concurrency(1).build()?;
    let patient = ServiceBuilder::new()
        .layer(BucketLayer::new(bucket, |req: &Request| req.tenant))
        .service(service_fn(handle));

    for _ in 0..3 {
        let body = patient.clone().oneshot(Request { tenant: "acme" }).await?;
        println!("patient: {body}");
    }
    Ok(())
}
