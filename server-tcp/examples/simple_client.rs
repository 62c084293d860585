use serde_json::json;
use server_tcp::BridgeClient;

const ADDRESS: &str = "carbon.memcached";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Connect to the server
    let mut client = BridgeClient::connect("127.0.0.1:5500").await?;
    println!("Connected to server at 127.0.0.1:5500");

    println!("\n=== Testing STATUS ===");
    let reply = client.request(ADDRESS, json!({"command": "status"})).await?;
    println!("Response: {}", reply);

    println!("\n=== Testing SET ===");
    let reply = client
        .request(
            ADDRESS,
            json!({"command": "set", "key": "hello", "value": "world", "shouldReply": true}),
        )
        .await?;
    println!("Response: {}", reply);

    println!("\n=== Testing GET ===");
    let reply = client
        .request(ADDRESS, json!({"command": "get", "key": "hello"}))
        .await?;
    println!("Response: {}", reply);

    println!("\n=== Testing INCR ===");
    client
        .send(ADDRESS, json!({"command": "set", "key": "hits", "value": 1}))
        .await?;
    let reply = client
        .request(
            ADDRESS,
            json!({"command": "incr", "key": "hits", "by": 41, "shouldReply": true}),
        )
        .await?;
    println!("Response: {}", reply);

    println!("\n=== Testing DELETE ===");
    let reply = client
        .request(
            ADDRESS,
            json!({"command": "delete", "key": "hello", "shouldReply": true}),
        )
        .await?;
    println!("Response: {}", reply);

    println!("\n=== Verifying deletion ===");
    let reply = client
        .request(ADDRESS, json!({"command": "get", "key": "hello"}))
        .await?;
    println!("Response: {}", reply);

    Ok(())
}
