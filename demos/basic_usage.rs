// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic nubo-store usage example.
//!
//! Demonstrates:
//! 1. Starting the store (Redis when `NUBO_REDIS_URL` is set, in-process otherwise)
//! 2. Caching a user and two posts
//! 3. Exact-match and range queries
//! 4. Enqueueing write-behind events
//! 5. A uniqueness check
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! NUBO_REDIS_URL=redis://localhost:6379 cargo run --example basic_usage
//! ```

use serde_json::json;
use nubo_store::{Action, EntityType, Filter, NuboStore, StoreConfig, Target};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    let config = StoreConfig {
        redis_url: std::env::var("NUBO_REDIS_URL").ok(),
        postgres_url: std::env::var("NUBO_POSTGRES_URL").ok(),
        mongo_url: std::env::var("NUBO_MONGO_URL").ok(),
        shard_count: 8,
        ..Default::default()
    };

    let mut store = NuboStore::new(config);
    println!("State: {}", store.state());
    store.start().await?;
    println!("State: {} ({:?})", store.state(), store.backends());

    // ─────────────────────────────────────────────────────────────────────────
    // Cache documents
    // ─────────────────────────────────────────────────────────────────────────
    let user = json!({
        "id": 1, "username": "alice", "email": "alice@nubo.io", "email_verified": true,
        "phone": null, "phone_verified": false, "password_hash": "x", "first_name": "Alice",
        "last_name": "Liddell", "birthdate": "2000-01-01", "sex": 1, "bio": null,
        "profile_picture_id": null, "grade": 0, "location": null, "school": null, "work": null,
        "badges": [], "desactivated": false, "banned": false, "ban_reason": null,
        "ban_expires_at": null, "created_at": 1_700_000_000, "updated_at": 1_700_000_000
    });
    if let Some(doc) = user.as_object() {
        store.set("users", doc).await?;
    }

    for (id, at) in [(10, 1_700_000_100), (11, 1_700_000_900)] {
        let post = json!({
            "id": id, "user_id": 1, "content": format!("post {id}"), "hashtags": ["demo"],
            "identifiers": [], "media_ids": [], "visibility": 0, "location": null,
            "created_at": at, "updated_at": at
        });
        if let Some(doc) = post.as_object() {
            store.set("posts", doc).await?;
        }
        store
            .enqueue(id, Some(1), EntityType::Posts, Action::Create, post, Target::ALL)
            .await?;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Query
    // ─────────────────────────────────────────────────────────────────────────
    let alice = store.get("users", &Filter::eq("username", json!("alice"))).await?;
    println!("users named alice: {}", alice.len());

    let recent = Filter::from_json(&json!({"user_id": 1, "created_at": {"$gte": 1_700_000_500}}))?;
    for post in store.get("posts", &recent).await? {
        println!("recent post {}: {}", post["id"], post["content"]);
    }

    println!("username 'alice' free: {}", store.is_unique("username", "alice").await?);
    println!("username 'bob' free:   {}", store.is_unique("username", "bob").await?);

    store.shutdown().await;
    println!("State: {}", store.state());
    Ok(())
}
