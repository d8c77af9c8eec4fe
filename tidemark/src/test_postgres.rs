//! Shared PostgreSQL container for the backend tests.
//!
//! One container is started per test binary. Each test gets its own database so
//! advisory locks and ledgers never leak between tests.

use std::sync::OnceLock;

use postgres::{Client, NoTls};
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

const PG_USER: &str = "postgres";
const PG_PASSWORD: &str = "postgres";
const PG_DB: &str = "postgres";

struct SharedContainer {
    port: u16,
    // Dropping either stops the container.
    _container: ContainerAsync<Postgres>,
    _runtime: tokio::runtime::Runtime,
}

static CONTAINER: OnceLock<SharedContainer> = OnceLock::new();

fn postgres_port() -> u16 {
    CONTAINER
        .get_or_init(|| {
            let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
            let (container, port) = runtime.block_on(async {
                let container = Postgres::default()
                    .start()
                    .await
                    .expect("failed to start postgres container");
                let port = container
                    .get_host_port_ipv4(5432)
                    .await
                    .expect("failed to get postgres port");
                (container, port)
            });
            SharedContainer {
                port,
                _container: container,
                _runtime: runtime,
            }
        })
        .port
}

/// Connection URL for database `db` in the shared container.
pub fn url_with_db(db: &str) -> String {
    format!(
        "postgres://{}:{}@127.0.0.1:{}/{}",
        PG_USER,
        PG_PASSWORD,
        postgres_port(),
        db
    )
}

/// Create an empty database with a unique name. Returns its URL and name.
pub fn fresh_postgres_db() -> (String, String) {
    let mut admin =
        Client::connect(&url_with_db(PG_DB), NoTls).expect("failed to connect as admin");
    let db_name = format!("test_{}", Uuid::new_v4().simple());
    admin
        .batch_execute(&format!("CREATE DATABASE \"{}\"", db_name))
        .expect("failed to create test database");
    (url_with_db(&db_name), db_name)
}
