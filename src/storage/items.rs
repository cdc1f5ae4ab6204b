use sqlx::SqliteConnection;
use std::time::Duration;

use super::schema::Database;
use super::types::{from_millis, now_millis, Item, ItemDbRow, NewItem, StorageError};

/// Column list shared by every joined item query. Annotation columns are
/// COALESCEd so missing annotation rows decode as defaults.
pub(super) const ITEM_SELECT: &str = r#"
    SELECT i.id, i.name, i.content, i.reference, i.dictionary_type,
           i.type_code, i.type_name, i.copyright, i.data_link,
           i.created_at, i.updated_at,
           COALESCE(ud.is_bookmarked, 0) AS is_bookmarked,
           ud.note,
           ud.last_viewed,
           COALESCE(ud.view_count, 0) AS view_count
"#;

/// How long a read waits for its view bump before returning without it.
const VIEW_BUMP_WAIT: Duration = Duration::from_millis(250);

impl Database {
    // ========================================================================
    // Item Writes
    // ========================================================================

    /// Insert or update a single item keyed by `id`, refreshing `updated_at`
    /// and replacing its search index entry in the same transaction.
    pub async fn upsert_item(&self, item: &NewItem) -> Result<(), StorageError> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;
        upsert_row(&mut tx, item, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Upsert every item in one transaction; returns the number written.
    ///
    /// Either all items commit or none do. Calling this again with an
    /// overlapping (or identical) set rewrites the same rows, so retries are
    /// safe. Duplicate ids within one batch resolve to the last occurrence.
    pub async fn bulk_upsert_items(&self, items: &[NewItem]) -> Result<usize, StorageError> {
        if items.is_empty() {
            return Ok(0);
        }

        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        for (position, item) in items.iter().enumerate() {
            if let Err(e) = upsert_row(&mut tx, item, now).await {
                tracing::warn!(
                    position = position,
                    id = %item.id,
                    batch = items.len(),
                    error = %e,
                    "Bulk upsert failed, rolling back"
                );
                // Dropping tx rolls back every row written so far
                return Err(e.into());
            }
        }

        tx.commit().await?;
        tracing::info!(items = items.len(), "Bulk upsert committed");
        Ok(items.len())
    }

    /// Delete an item and its index entry. The annotation row is kept.
    ///
    /// Returns whether an item existed.
    pub async fn delete_item(&self, id: &str) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64,)> =
            sqlx::query_as("DELETE FROM dictionary_items WHERE id = ? RETURNING rowid")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((rowid,)) = row else {
            return Ok(false);
        };
        unindex(&mut tx, rowid).await?;

        tx.commit().await?;
        Ok(true)
    }

    // ========================================================================
    // Item Reads
    // ========================================================================

    /// Fetch an item with its annotation and record the view.
    ///
    /// The view bookkeeping (`view_count + 1`, `last_viewed = now`) runs on
    /// its own task and never fails the read. The read waits for it at most
    /// `VIEW_BUMP_WAIT`; when it lands in time the returned annotation
    /// already reflects the new view, otherwise the item is returned as read
    /// and the bump finishes (or logs its failure) in the background.
    ///
    /// # Errors
    ///
    /// `StorageError::NotFound` if no item has this id.
    pub async fn get_item_by_id(&self, id: &str) -> Result<Item, StorageError> {
        let sql = format!(
            "{} FROM dictionary_items i LEFT JOIN user_annotations ud ON ud.item_id = i.id WHERE i.id = ?",
            ITEM_SELECT
        );
        let row = sqlx::query_as::<_, ItemDbRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let mut item = row
            .map(ItemDbRow::into_item)
            .ok_or_else(|| StorageError::NotFound(id.to_owned()))?;

        let db = self.clone();
        let item_id = id.to_owned();
        let bump = tokio::spawn(async move {
            let result = db.record_view(&item_id).await;
            if let Err(e) = &result {
                tracing::warn!(id = %item_id, error = %e, "Failed to record item view");
            }
            result
        });

        match tokio::time::timeout(VIEW_BUMP_WAIT, bump).await {
            Ok(Ok(Ok((view_count, last_viewed)))) => {
                item.annotation.view_count = view_count;
                item.annotation.last_viewed = Some(from_millis(last_viewed));
            }
            Ok(Ok(Err(_))) => {}
            Ok(Err(e)) => {
                tracing::warn!(id = %id, error = %e, "View bookkeeping task failed");
            }
            Err(_) => {
                tracing::debug!(id = %id, "View bookkeeping still pending, returning item as read");
            }
        }

        Ok(item)
    }

    /// Number of stored dictionary items.
    pub async fn item_count(&self) -> Result<i64, StorageError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dictionary_items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ========================================================================
    // Reset
    // ========================================================================

    /// Delete every item, annotation and index row in one transaction.
    ///
    /// Irreversible. Either all three are emptied or nothing changes.
    pub async fn reset(&self) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        let annotations = sqlx::query("DELETE FROM user_annotations")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let items = sqlx::query("DELETE FROM dictionary_items")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM items_fts").execute(&mut *tx).await?;

        tx.commit().await?;
        tracing::info!(items = items, annotations = annotations, "Dictionary store reset");
        Ok(())
    }
}

// ============================================================================
// Row + Index Maintenance
// ============================================================================

/// Upsert one row and re-index it. Must run inside the caller's transaction.
async fn upsert_row(
    conn: &mut SqliteConnection,
    item: &NewItem,
    now: i64,
) -> Result<(), sqlx::Error> {
    let (rowid,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO dictionary_items (
            id, name, content, reference, dictionary_type,
            type_code, type_name, copyright, data_link, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            content = excluded.content,
            reference = excluded.reference,
            dictionary_type = excluded.dictionary_type,
            type_code = excluded.type_code,
            type_name = excluded.type_name,
            copyright = excluded.copyright,
            data_link = excluded.data_link,
            updated_at = excluded.updated_at
        RETURNING rowid
    "#,
    )
    .bind(&item.id)
    .bind(&item.name)
    .bind(&item.content)
    .bind(&item.reference)
    .bind(item.dictionary_type.map(|t| t.as_str()))
    .bind(&item.type_code)
    .bind(&item.type_name)
    .bind(&item.copyright)
    .bind(&item.data_link)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    reindex(conn, rowid, item).await
}

/// Replace the index entry for `rowid` with the item's current text.
async fn reindex(
    conn: &mut SqliteConnection,
    rowid: i64,
    item: &NewItem,
) -> Result<(), sqlx::Error> {
    unindex(conn, rowid).await?;
    sqlx::query(
        "INSERT INTO items_fts(rowid, name, content, reference, type_name) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(rowid)
    .bind(&item.name)
    .bind(&item.content)
    .bind(&item.reference)
    .bind(&item.type_name)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Remove the index entry for `rowid`, if any.
async fn unindex(conn: &mut SqliteConnection, rowid: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM items_fts WHERE rowid = ?")
        .bind(rowid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, DictionaryType, NewItem, SearchFilters, StorageError};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn test_item(id: &str, name: &str) -> NewItem {
        NewItem {
            id: id.to_string(),
            name: name.to_string(),
            content: Some(format!("Description of {}", name)),
            reference: None,
            dictionary_type: Some(DictionaryType::Term),
            type_code: Some("T1".to_string()),
            type_name: Some("Structure".to_string()),
            copyright: None,
            data_link: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_item_insert_and_update() {
        let db = test_db().await;
        db.upsert_item(&test_item("A", "Dolmen")).await.unwrap();

        let first = db.get_item_by_id("A").await.unwrap();
        assert_eq!(first.entry.name, "Dolmen");

        let mut changed = test_item("A", "Menhir");
        changed.content = None;
        db.upsert_item(&changed).await.unwrap();

        let second = db.get_item_by_id("A").await.unwrap();
        assert_eq!(second.entry.name, "Menhir");
        assert_eq!(second.entry.content, None);
        assert_eq!(second.entry.created_at, first.entry.created_at);
        assert!(second.entry.updated_at >= first.entry.updated_at);
        assert_eq!(db.item_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_replaces_index_entry() {
        let db = test_db().await;
        db.upsert_item(&test_item("A", "Dolmen")).await.unwrap();
        db.upsert_item(&test_item("A", "Menhir")).await.unwrap();

        let filters = SearchFilters::default();
        assert!(db.search_items("dolmen", &filters).await.unwrap().is_empty());
        let hits = db.search_items("menhir", &filters).await.unwrap();
        assert_eq!(hits.len(), 1);

        let report = db.check_index_consistency().await.unwrap();
        assert!(report.is_consistent);
        assert_eq!(report.index_count, 1);
    }

    #[tokio::test]
    async fn test_bulk_upsert_is_idempotent() {
        let db = test_db().await;
        let items = vec![
            test_item("A", "Dolmen"),
            test_item("B", "Pottery"),
            test_item("C", "Shell mound"),
        ];

        assert_eq!(db.bulk_upsert_items(&items).await.unwrap(), 3);
        let before = db.export_all().await.unwrap();

        assert_eq!(db.bulk_upsert_items(&items).await.unwrap(), 3);
        let after = db.export_all().await.unwrap();

        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.entry.id, a.entry.id);
            assert_eq!(b.entry.name, a.entry.name);
            assert_eq!(b.entry.content, a.entry.content);
            assert_eq!(b.entry.type_code, a.entry.type_code);
            assert_eq!(b.entry.created_at, a.entry.created_at);
            assert!(a.entry.updated_at >= b.entry.updated_at);
        }
        assert!(db.check_index_consistency().await.unwrap().is_consistent);
    }

    #[tokio::test]
    async fn test_bulk_upsert_rolls_back_on_constraint_violation() {
        let db = test_db().await;
        let items = vec![
            test_item("A", "Dolmen"),
            test_item("B", "Pottery"),
            test_item("", "No identifier"),
            test_item("D", "Bronze mirror"),
        ];

        let result = db.bulk_upsert_items(&items).await;
        assert!(matches!(result, Err(StorageError::Database(_))));

        assert_eq!(db.item_count().await.unwrap(), 0);
        assert!(db
            .search_items("", &SearchFilters::default())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(db.check_index_consistency().await.unwrap().index_count, 0);
    }

    #[tokio::test]
    async fn test_bulk_upsert_failure_keeps_previous_state() {
        let db = test_db().await;
        db.bulk_upsert_items(&[test_item("A", "Dolmen")]).await.unwrap();

        let bad = vec![test_item("A", "Renamed"), test_item("", "Broken")];
        assert!(db.bulk_upsert_items(&bad).await.is_err());

        let item = db.get_item_by_id("A").await.unwrap();
        assert_eq!(item.entry.name, "Dolmen");
    }

    #[tokio::test]
    async fn test_bulk_upsert_duplicate_ids_in_batch() {
        let db = test_db().await;
        let items = vec![test_item("A", "First"), test_item("A", "Second")];
        db.bulk_upsert_items(&items).await.unwrap();

        assert_eq!(db.item_count().await.unwrap(), 1);
        assert_eq!(db.get_item_by_id("A").await.unwrap().entry.name, "Second");
        assert!(db.check_index_consistency().await.unwrap().is_consistent);
    }

    #[tokio::test]
    async fn test_bulk_upsert_empty_is_noop() {
        let db = test_db().await;
        assert_eq!(db.bulk_upsert_items(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_item_not_found() {
        let db = test_db().await;
        let result = db.get_item_by_id("missing").await;
        assert!(matches!(result, Err(StorageError::NotFound(id)) if id == "missing"));
        // No annotation row is created for a missing item
        assert!(db.list_recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_item_counts_views() {
        let db = test_db().await;
        db.upsert_item(&test_item("A", "Dolmen")).await.unwrap();

        let mut last = None;
        for expected in 1..=3 {
            let before = chrono::Utc::now();
            let item = db.get_item_by_id("A").await.unwrap();
            assert_eq!(item.annotation.view_count, expected);
            let viewed = item.annotation.last_viewed.unwrap();
            assert!(viewed >= before - chrono::Duration::milliseconds(1));
            last = Some(viewed);
        }

        let exported = db.export_all().await.unwrap();
        assert_eq!(exported[0].annotation.view_count, 3);
        assert_eq!(exported[0].annotation.last_viewed, last);
    }

    #[tokio::test]
    async fn test_delete_item_removes_index_entry() {
        let db = test_db().await;
        db.upsert_item(&test_item("A", "Dolmen")).await.unwrap();
        db.toggle_bookmark("A", true).await.unwrap();

        assert!(db.delete_item("A").await.unwrap());
        assert!(!db.delete_item("A").await.unwrap());

        let filters = SearchFilters::default();
        assert!(db.search_items("Dolmen", &filters).await.unwrap().is_empty());
        assert!(matches!(
            db.get_item_by_id("A").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(db.check_index_consistency().await.unwrap().is_consistent);
    }

    #[tokio::test]
    async fn test_reset_empties_everything() {
        let db = test_db().await;
        db.bulk_upsert_items(&[test_item("A", "Dolmen"), test_item("B", "Pottery")])
            .await
            .unwrap();
        db.toggle_bookmark("A", true).await.unwrap();
        db.save_note("B", "check later").await.unwrap();
        db.get_item_by_id("B").await.unwrap();

        db.reset().await.unwrap();

        assert!(db.list_bookmarked().await.unwrap().is_empty());
        assert!(db.list_recent(10).await.unwrap().is_empty());
        assert!(db
            .search_items("", &SearchFilters::default())
            .await
            .unwrap()
            .is_empty());
        assert!(db
            .search_items("dolmen", &SearchFilters::default())
            .await
            .unwrap()
            .is_empty());
        let report = db.check_index_consistency().await.unwrap();
        assert_eq!(report.items_count, 0);
        assert_eq!(report.index_count, 0);

        // Re-ingesting after reset starts from a clean annotation state
        db.upsert_item(&test_item("A", "Dolmen")).await.unwrap();
        let item = db.get_item_by_id("A").await.unwrap();
        assert!(!item.annotation.is_bookmarked);
        assert_eq!(item.annotation.view_count, 1);
    }

    #[tokio::test]
    async fn test_view_bump_does_not_delay_read_under_write_lock() {
        let dir = std::env::temp_dir().join(format!("archdict_items_bump_{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        let path = dir.join("dict.db");
        let db = Database::open(path.to_str().unwrap()).await.unwrap();
        db.upsert_item(&test_item("A", "Dolmen")).await.unwrap();

        // Another writer holds the lock for longer than the read may wait
        let mut writer = db.pool.begin().await.unwrap();
        sqlx::query("UPDATE dictionary_items SET updated_at = updated_at")
            .execute(&mut *writer)
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let item = db.get_item_by_id("A").await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(item.entry.name, "Dolmen");
        assert_eq!(item.annotation.view_count, 0);
        assert!(elapsed < std::time::Duration::from_secs(2), "read took {:?}", elapsed);

        // Once the writer is gone the pending bump lands
        writer.rollback().await.unwrap();
        let mut view_count = 0;
        for _ in 0..50 {
            view_count = db.export_all().await.unwrap()[0].annotation.view_count;
            if view_count == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert_eq!(view_count, 1);

        db.close().await;
        std::fs::remove_dir_all(&dir).ok();
    }
}
