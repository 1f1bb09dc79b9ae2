// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis key layout.
//!
//! ```text
//! cache:{collection}:{id}          hash    document fields
//! idx:{collection}:{field}:{value} set     ids with field == value
//! idx:zset:{collection}:{field}    zset    ids scored by field
//! idx:lru:global                   zset    {collection}:{id} scored by last access
//! q:{shard}:{Entity}:{ACTION}      list    write-behind events
//! h:stats:{shard}                  hash    {Entity}:{ACTION}:count / :ts
//! flux:{channel}                   pubsub  flux message ids
//! fluxmsg:{id}                     string  flux payload with TTL
//! ```

/// Global recency sorted set.
pub const RECENCY_KEY: &str = "idx:lru:global";

#[must_use]
pub fn document(collection: &str, id: i64) -> String {
    format!("cache:{}:{}", collection, id)
}

#[must_use]
pub fn exact_index(collection: &str, field: &str, token: &str) -> String {
    format!("idx:{}:{}:{}", collection, field, token)
}

#[must_use]
pub fn range_index(collection: &str, field: &str) -> String {
    format!("idx:zset:{}:{}", collection, field)
}

/// Member of [`RECENCY_KEY`] for one document.
#[must_use]
pub fn recency_member(collection: &str, id: i64) -> String {
    format!("{}:{}", collection, id)
}

/// Split a recency member back into collection and id.
#[must_use]
pub fn parse_recency_member(member: &str) -> Option<(&str, i64)> {
    let (collection, id) = member.rsplit_once(':')?;
    if collection.is_empty() {
        return None;
    }
    Some((collection, id.parse().ok()?))
}

#[must_use]
pub fn queue(shard: u32, entity: &str, action: &str) -> String {
    format!("q:{}:{}:{}", shard, entity, action)
}

#[must_use]
pub fn shard_stats(shard: u32) -> String {
    format!("h:stats:{}", shard)
}

#[must_use]
pub fn stats_count_field(entity: &str, action: &str) -> String {
    format!("{}:{}:count", entity, action)
}

#[must_use]
pub fn stats_ts_field(entity: &str, action: &str) -> String {
    format!("{}:{}:ts", entity, action)
}

#[must_use]
pub fn flux_channel(channel: &str) -> String {
    format!("flux:{}", channel)
}

#[must_use]
pub fn flux_message(id: &str) -> String {
    format!("fluxmsg:{}", id)
}
