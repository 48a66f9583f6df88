//! Shared container setup for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
pub async fn start_rabbitmq() -> (ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");
    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}/%2f", host, host_port);
    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

/// Start PostgreSQL container.
///
/// Returns (container, connection_string) suitable for sqlx.
pub async fn start_postgres() -> (ContainerAsync<GenericImage>, String) {
    // PostgreSQL prints "database system is ready to accept connections" twice:
    // once during initial setup and once when fully ready.
    let image = GenericImage::new("postgres", "16")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stdout(
            "database system is ready to accept connections",
        ));

    let container = image
        .with_env_var("POSTGRES_USER", "eventbus")
        .with_env_var("POSTGRES_PASSWORD", "eventbus")
        .with_env_var("POSTGRES_DB", "events")
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start postgres container");

    // Brief delay to ensure PostgreSQL is fully ready to accept connections
    tokio::time::sleep(Duration::from_secs(1)).await;

    let host_port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get mapped port");
    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let connection_string = format!("postgres://eventbus:eventbus@{}:{}/events", host, host_port);
    println!("PostgreSQL available at: {}", connection_string);

    (container, connection_string)
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check().await
}
