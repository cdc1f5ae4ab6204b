use super::schema::Database;
use super::types::{now_millis, StorageError};

impl Database {
    /// Set the bookmark flag for an item, creating its annotation if needed.
    ///
    /// Other annotation fields are left as they were. The item itself does not
    /// have to exist: annotations survive re-ingestion and deletion.
    pub async fn toggle_bookmark(
        &self,
        item_id: &str,
        bookmarked: bool,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO user_annotations (item_id, is_bookmarked) VALUES (?, ?)
            ON CONFLICT(item_id) DO UPDATE SET is_bookmarked = excluded.is_bookmarked
        "#,
        )
        .bind(item_id)
        .bind(bookmarked)
        .execute(&self.pool)
        .await?;

        tracing::debug!(item_id = %item_id, bookmarked = bookmarked, "Bookmark updated");
        Ok(())
    }

    /// Replace the note for an item, creating its annotation if needed.
    ///
    /// An empty string is stored as-is; it is not the same as "no note".
    pub async fn save_note(&self, item_id: &str, note: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO user_annotations (item_id, note) VALUES (?, ?)
            ON CONFLICT(item_id) DO UPDATE SET note = excluded.note
        "#,
        )
        .bind(item_id)
        .bind(note)
        .execute(&self.pool)
        .await?;

        tracing::debug!(item_id = %item_id, chars = note.chars().count(), "Note saved");
        Ok(())
    }

    /// Increment the view count and stamp `last_viewed`.
    ///
    /// Returns the new `(view_count, last_viewed_ms)`. A single statement, so
    /// concurrent views never lose an increment.
    pub(crate) async fn record_view(&self, item_id: &str) -> Result<(i64, i64), StorageError> {
        let now = now_millis();
        let row: (i64, i64) = sqlx::query_as(
            r#"
            INSERT INTO user_annotations (item_id, view_count, last_viewed) VALUES (?, 1, ?)
            ON CONFLICT(item_id) DO UPDATE SET
                view_count = view_count + 1,
                last_viewed = excluded.last_viewed
            RETURNING view_count, last_viewed
        "#,
        )
        .bind(item_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, NewItem};
    use pretty_assertions::assert_eq;

    async fn db_with_item(id: &str) -> Database {
        let db = Database::open(":memory:").await.unwrap();
        db.upsert_item(&NewItem {
            id: id.to_string(),
            name: "Comb-pattern pottery".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_toggle_bookmark_on_and_off() {
        let db = db_with_item("A").await;

        db.toggle_bookmark("A", true).await.unwrap();
        assert_eq!(db.list_bookmarked().await.unwrap().len(), 1);

        db.toggle_bookmark("A", false).await.unwrap();
        assert!(db.list_bookmarked().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bookmark_preserves_note_and_views() {
        let db = db_with_item("A").await;
        db.save_note("A", "Neolithic").await.unwrap();
        db.get_item_by_id("A").await.unwrap();

        db.toggle_bookmark("A", true).await.unwrap();

        let item = db.get_item_by_id("A").await.unwrap();
        assert!(item.annotation.is_bookmarked);
        assert_eq!(item.annotation.note.as_deref(), Some("Neolithic"));
        assert_eq!(item.annotation.view_count, 2);
    }

    #[tokio::test]
    async fn test_save_note_overwrites_and_keeps_empty() {
        let db = db_with_item("A").await;
        db.toggle_bookmark("A", true).await.unwrap();

        db.save_note("A", "first").await.unwrap();
        db.save_note("A", "second").await.unwrap();
        let item = db.get_item_by_id("A").await.unwrap();
        assert_eq!(item.annotation.note.as_deref(), Some("second"));
        assert!(item.annotation.is_bookmarked);

        db.save_note("A", "").await.unwrap();
        let item = db.get_item_by_id("A").await.unwrap();
        assert_eq!(item.annotation.note.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_annotation_before_item_exists() {
        let db = Database::open(":memory:").await.unwrap();
        db.toggle_bookmark("later", true).await.unwrap();
        db.save_note("later", "ingest pending").await.unwrap();

        // Not listed until the item exists
        assert!(db.list_bookmarked().await.unwrap().is_empty());

        db.upsert_item(&NewItem {
            id: "later".to_string(),
            name: "Shell mound".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        let bookmarked = db.list_bookmarked().await.unwrap();
        assert_eq!(bookmarked.len(), 1);
        assert_eq!(bookmarked[0].annotation.note.as_deref(), Some("ingest pending"));
    }

    #[tokio::test]
    async fn test_annotation_survives_item_reupsert() {
        let db = db_with_item("A").await;
        db.toggle_bookmark("A", true).await.unwrap();
        db.save_note("A", "keep me").await.unwrap();

        db.upsert_item(&NewItem {
            id: "A".to_string(),
            name: "Renamed".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        let item = db.get_item_by_id("A").await.unwrap();
        assert_eq!(item.entry.name, "Renamed");
        assert!(item.annotation.is_bookmarked);
        assert_eq!(item.annotation.note.as_deref(), Some("keep me"));
    }

    #[tokio::test]
    async fn test_concurrent_views_are_not_lost() {
        let dir = std::env::temp_dir().join(format!("archdict_views_{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        let path = dir.join("dict.db");
        let db = Database::open(path.to_str().unwrap()).await.unwrap();
        db.upsert_item(&NewItem {
            id: "A".to_string(),
            name: "Dolmen".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = db.clone();
            handles.push(tokio::spawn(async move { db.record_view("A").await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let exported = db.export_all().await.unwrap();
        assert_eq!(exported[0].annotation.view_count, 8);

        db.close().await;
        std::fs::remove_dir_all(&dir).ok();
    }
}
