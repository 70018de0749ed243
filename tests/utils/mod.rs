#![allow(dead_code)]

use std::collections::HashMap;

use crm_webhooks::{config::Config, server::Server};
use webhook_store::SqliteStore;

pub struct TestApp {
    pub addr: String,
    pub store: SqliteStore,
}

pub async fn spawn_server() -> TestApp {
    let overrides: HashMap<String, String> = [
        ("server.host", "localhost"),
        ("server.port", "0"),
        ("database.path", ":memory:"),
        ("webhooks.dispatch_timeout_secs", "2"),
        ("scheduler.interval_secs", "3600"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let config = Config::load_with_sources(Some(overrides)).unwrap();

    let server = Server::new(&config).await.unwrap();

    let port = server.port().unwrap();
    let store = server.store().clone();
    tokio::spawn(server.run());

    TestApp {
        addr: format!("http://{}:{}", config.server.host, port),
        store,
    }
}
