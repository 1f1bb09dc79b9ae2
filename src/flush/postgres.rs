// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational flusher.
//!
//! Per entity type, in foreign-key order:
//!
//! - **inserts**: one transaction, rows streamed with `COPY ... FROM STDIN`.
//!   A row that cannot be mapped is skipped; a COPY failure rolls back the
//!   whole insert batch.
//! - **updates**: successive patches of one id are merged, then grouped by
//!   column set. Each group is copied into an `ON COMMIT DROP` temp table and
//!   merged with one `UPDATE ... FROM`.
//! - **deletes**: one `DELETE ... WHERE id = ANY($1)`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgConnection;
use tracing::{debug, error, warn};

use super::mapper::{quote_ident, Column, MapperRegistry, TableMapping};
use super::{group_by_entity, FlushReport, Flusher};
use crate::metrics::{self, FlushTimer};
use crate::queue::{Action, AsyncEvent};
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::StorageError;

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct PostgresFlusher {
    pool: PgPool,
    mappers: Arc<MapperRegistry>,
}

impl PostgresFlusher {
    pub fn new(pool: PgPool, mappers: MapperRegistry) -> Self {
        Self {
            pool,
            mappers: Arc::new(mappers),
        }
    }

    /// Connect with startup-mode retry.
    pub async fn connect(connection_string: &str, mappers: MapperRegistry) -> Result<Self, StorageError> {
        let pool = retry("postgres_connect", &RetryConfig::startup(), || async {
            PgPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;
        Ok(Self::new(pool, mappers))
    }

    /// Shared pool, also used by the uniqueness probes.
    #[must_use]
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    async fn bulk_insert(&self, mapping: &TableMapping, events: &[&AsyncEvent]) -> Result<FlushReport, StorageError> {
        let columns: Vec<&Column> = mapping.columns.iter().collect();
        let mut report = FlushReport::default();
        let mut data = String::new();
        for event in events {
            match mapping.render_row(event.id, &event.payload, &columns) {
                Ok(row) => {
                    data.push_str(&row);
                    report.written += 1;
                }
                Err(e) => {
                    warn!(table = %mapping.table, id = event.id, error = %e, "Skipping unmappable insert row");
                    report.skipped += 1;
                }
            }
        }
        if report.written == 0 {
            return Ok(report);
        }

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let statement = TableMapping::copy_statement(&mapping.qualified_name(), &columns);
        copy_rows(&mut tx, &statement, data).await?;
        tx.commit().await.map_err(backend)?;

        debug!(table = %mapping.table, rows = report.written, "Bulk insert committed");
        Ok(report)
    }

    async fn bulk_update(&self, mapping: &TableMapping, events: &[&AsyncEvent]) -> Result<FlushReport, StorageError> {
        if !mapping.updatable {
            warn!(table = %mapping.table, count = events.len(), "Table takes no updates, skipping");
            return Ok(FlushReport {
                written: 0,
                skipped: events.len(),
            });
        }

        let (groups, mut skipped) = plan_updates(mapping, events);
        let mut written = 0;
        if groups.is_empty() {
            return Ok(FlushReport { written, skipped });
        }

        let stamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for (i, group) in groups.iter().enumerate() {
            let temp = format!("tmp_{}_{}_{}_{}", mapping.schema, mapping.table, stamp, i);
            let Some(merge) = mapping.merge_statement(&temp, &group.columns) else {
                skipped += group.rows.len();
                continue;
            };

            let mut data = String::new();
            let mut rows = 0;
            for (id, patch) in &group.rows {
                match mapping.render_row(*id, patch, &group.columns) {
                    Ok(row) => {
                        data.push_str(&row);
                        rows += 1;
                    }
                    Err(e) => {
                        warn!(table = %mapping.table, id, error = %e, "Skipping unmappable update row");
                        skipped += 1;
                    }
                }
            }
            if rows == 0 {
                continue;
            }

            sqlx::query(&mapping.temp_table_statement(&temp, &group.columns))
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            let statement = TableMapping::copy_statement(&quote_ident(&temp), &group.columns);
            copy_rows(&mut tx, &statement, data).await?;
            sqlx::query(&merge).execute(&mut *tx).await.map_err(backend)?;
            written += rows;
        }
        tx.commit().await.map_err(backend)?;

        debug!(table = %mapping.table, rows = written, groups = groups.len(), "Bulk update committed");
        Ok(FlushReport { written, skipped })
    }

    async fn bulk_delete(&self, mapping: &TableMapping, events: &[&AsyncEvent]) -> Result<FlushReport, StorageError> {
        let mut ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        ids.sort_unstable();
        ids.dedup();

        let statement = format!(
            "DELETE FROM {} WHERE {} = ANY($1)",
            mapping.qualified_name(),
            quote_ident("id")
        );
        let result = sqlx::query(&statement)
            .bind(&ids)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        debug!(table = %mapping.table, requested = ids.len(), deleted = result.rows_affected(), "Bulk delete done");
        Ok(FlushReport {
            written: ids.len(),
            skipped: 0,
        })
    }
}

#[async_trait]
impl Flusher for PostgresFlusher {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn flush(&self, events: &[AsyncEvent]) -> Result<FlushReport, StorageError> {
        let mut timer = FlushTimer::new("postgres");
        let mut report = FlushReport::default();
        let mut failures = Vec::new();

        for (entity, group) in group_by_entity(events) {
            let Some(mapping) = self.mappers.get(&entity) else {
                warn!(entity = %entity, count = group.len(), "No table mapping, skipping events");
                report.skipped += group.len();
                continue;
            };

            for action in Action::ALL {
                let batch: Vec<&AsyncEvent> = group.iter().copied().filter(|e| e.action == action).collect();
                if batch.is_empty() {
                    continue;
                }
                let outcome = match action {
                    Action::Create => self.bulk_insert(mapping, &batch).await,
                    Action::Update => self.bulk_update(mapping, &batch).await,
                    Action::Delete => self.bulk_delete(mapping, &batch).await,
                };
                match outcome {
                    Ok(r) => report.merge(r),
                    Err(e) => {
                        error!(
                            table = %mapping.table,
                            action = %action,
                            count = batch.len(),
                            error = %e,
                            "Relational flush failed, batch dropped"
                        );
                        failures.push(format!("{}/{}: {}", mapping.table, action, e));
                    }
                }
            }
        }

        if report.skipped > 0 {
            metrics::record_rows_skipped(report.skipped);
        }
        if !failures.is_empty() {
            return Err(StorageError::Backend(failures.join("; ")));
        }
        timer.succeed();
        Ok(report)
    }
}

/// Stream CSV rows through `COPY ... FROM STDIN` on an open connection.
async fn copy_rows(conn: &mut PgConnection, statement: &str, data: String) -> Result<u64, StorageError> {
    let mut copy = conn.copy_in_raw(statement).await.map_err(backend)?;
    let sent = copy.send(data.into_bytes()).await.map(|_| ()).map_err(backend);
    if let Err(e) = sent {
        if let Err(abort) = copy.abort(e.to_string()).await {
            debug!(error = %abort, "COPY abort reported an error");
        }
        return Err(e);
    }
    copy.finish().await.map_err(backend)
}

/// Update rows sharing one column set.
#[derive(Debug)]
struct UpdateGroup<'a> {
    columns: Vec<&'a Column>,
    rows: Vec<(i64, Value)>,
}

/// Merge successive patches per id (later fields win) and group the merged
/// patches by the mapped columns they touch. Returns the groups in first-seen
/// order and the number of events skipped.
fn plan_updates<'a>(mapping: &'a TableMapping, events: &[&AsyncEvent]) -> (Vec<UpdateGroup<'a>>, usize) {
    let mut skipped = 0;
    let mut merged: Vec<(i64, Map<String, Value>)> = Vec::new();
    let mut position: HashMap<i64, usize> = HashMap::new();

    for event in events {
        let Value::Object(patch) = &event.payload else {
            warn!(table = %mapping.table, id = event.id, "Update payload is not an object, skipping");
            skipped += 1;
            continue;
        };
        match position.get(&event.id) {
            Some(&i) => merged[i].1.extend(patch.clone()),
            None => {
                position.insert(event.id, merged.len());
                merged.push((event.id, patch.clone()));
            }
        }
    }

    let mut groups: Vec<UpdateGroup<'a>> = Vec::new();
    let mut by_columns: HashMap<Vec<String>, usize> = HashMap::new();
    for (id, patch) in merged {
        let columns = mapping.update_columns(&patch);
        if columns.len() < 2 {
            debug!(table = %mapping.table, id, "Update touches no mapped column, skipping");
            skipped += 1;
            continue;
        }
        let key: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let slot = *by_columns.entry(key).or_insert_with(|| {
            groups.push(UpdateGroup {
                columns,
                rows: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].rows.push((id, Value::Object(patch)));
    }
    (groups, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EntityType, Target};
    use serde_json::json;

    fn update(id: i64, payload: Value) -> AsyncEvent {
        AsyncEvent::new(id, EntityType::Posts, Action::Update, payload, Target::POSTGRES)
    }

    fn posts() -> TableMapping {
        MapperRegistry::builtin().get(&EntityType::Posts).unwrap().clone()
    }

    #[test]
    fn test_plan_merges_patches_per_id() {
        let mapping = posts();
        let events = [
            update(1, json!({"content": "a"})),
            update(1, json!({"content": "b", "visibility": 1})),
        ];
        let refs: Vec<&AsyncEvent> = events.iter().collect();
        let (groups, skipped) = plan_updates(&mapping, &refs);
        assert_eq!(skipped, 0);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].rows, vec![(1, json!({"content": "b", "visibility": 1}))]);
        let names: Vec<&str> = groups[0].columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "content", "visibility"]);
    }

    #[test]
    fn test_plan_groups_by_column_set() {
        let mapping = posts();
        let events = [
            update(1, json!({"content": "x"})),
            update(2, json!({"visibility": 2})),
            update(3, json!({"content": "y"})),
            update(4, json!("not an object")),
            update(5, json!({"unmapped": true})),
        ];
        let refs: Vec<&AsyncEvent> = events.iter().collect();
        let (groups, skipped) = plan_updates(&mapping, &refs);
        assert_eq!(skipped, 2);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].rows.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(groups[1].rows.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![2]);
    }
}
