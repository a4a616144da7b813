use criterion::{black_box, criterion_group, criterion_main, Criterion};

use async_trait::async_trait;
use msgpool::native::{self, Credentials, Destination, FailureListener, SessionMode};
use msgpool::policy::Policy;
use msgpool::pool::Pool;
use std::sync::Arc;

fn criterion_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("concurrently borrow 10", |b| {
        b.to_async(&rt).iter(|| concurrent_borrows(black_box(10)))
    });

    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("concurrently borrow 100", |b| {
        b.to_async(&rt).iter(|| concurrent_borrows(black_box(100)))
    });

    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("concurrently borrow 1000", |b| {
        b.to_async(&rt).iter(|| concurrent_borrows(black_box(1000)))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);

struct TestProducer {}

#[async_trait]
impl native::Producer for TestProducer {
    async fn close(&self) -> Result<(), native::Error> {
        Ok(())
    }
}

struct TestSession {}

#[async_trait]
impl native::Session for TestSession {
    type Producer = TestProducer;

    async fn create_producer(&self, _: &Destination) -> Result<Self::Producer, native::Error> {
        Ok(TestProducer {})
    }

    async fn close(&self) -> Result<(), native::Error> {
        Ok(())
    }
}

struct TestConnection {}

#[async_trait]
impl native::Connection for TestConnection {
    type Session = TestSession;

    async fn create_session(&self, _: SessionMode) -> Result<Self::Session, native::Error> {
        Ok(TestSession {})
    }

    fn set_failure_listener(&self, _: FailureListener) {}

    async fn close(&self) -> Result<(), native::Error> {
        Ok(())
    }
}

struct TestConnectionFactory {}

#[async_trait]
impl native::ConnectionFactory for TestConnectionFactory {
    type Connection = TestConnection;

    async fn connect(&self, _: Option<&Credentials>) -> Result<Self::Connection, native::Error> {
        Ok(TestConnection {})
    }
}

async fn concurrent_borrows(count: usize) {
    let pool = Arc::new(
        Pool::new(
            "bench".to_string(),
            Arc::new(TestConnectionFactory {}),
            Policy::default(),
        )
        .expect("Failed to create pool"),
    );
    let destination = Destination::new("bench");

    let futs: Vec<_> = (0..count)
        .map(|_| {
            tokio::task::spawn({
                let pool = pool.clone();
                let destination = destination.clone();
                async move {
                    let connection = pool.create_connection().await.expect("No connection");
                    let session = connection
                        .create_default_session()
                        .await
                        .expect("No session");
                    session
                        .create_producer(&destination)
                        .await
                        .expect("No producer");
                    tokio::time::sleep(tokio::time::Duration::from_micros(50)).await;
                    drop(session);
                }
            })
        })
        .collect();
    futures::future::try_join_all(futs)
        .await
        .expect("Failed to borrow sessions");
    pool.close().await;
}
