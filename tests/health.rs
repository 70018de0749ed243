mod utils;

use reqwest::Client;

#[tokio::test]
async fn test_health_check_works() {
    let app = utils::spawn_server().await;
    let client = Client::new();

    let response = client
        .get(format!("{}/health", app.addr))
        .send()
        .await
        .expect("Failed to execute request.");

    // Verify the response
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.expect("Failed to read body");
    assert_eq!(body["status"], "ok");
}
