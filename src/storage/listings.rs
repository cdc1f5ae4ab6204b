use super::items::ITEM_SELECT;
use super::schema::Database;
use super::types::{Category, Item, ItemDbRow, StorageError};

/// Upper bound on rows returned by the unpaginated listings.
const LISTING_CAP: i64 = 10_000;

impl Database {
    /// Distinct categories present in the store with item counts.
    ///
    /// Items without a `type_code` form an uncategorized group with
    /// `id: None`, listed last, so the counts sum to the item count. Sorted
    /// by `type_name`, ties broken by `type_code`.
    pub async fn list_categories(&self) -> Result<Vec<Category>, StorageError> {
        let rows: Vec<(Option<String>, Option<String>, i64)> = sqlx::query_as(
            r#"
            SELECT type_code, type_name, COUNT(*) AS count
            FROM dictionary_items
            GROUP BY type_code, type_name
            ORDER BY type_code IS NULL, type_name, type_code
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name, count)| Category { id, name, count })
            .collect())
    }

    /// Items in a category, by name.
    pub async fn list_by_category(&self, type_code: &str) -> Result<Vec<Item>, StorageError> {
        let sql = format!(
            r#"{}
            FROM dictionary_items i
            LEFT JOIN user_annotations ud ON ud.item_id = i.id
            WHERE i.type_code = ?
            ORDER BY i.name COLLATE NOCASE, i.id
            LIMIT ?"#,
            ITEM_SELECT
        );
        let rows = sqlx::query_as::<_, ItemDbRow>(&sql)
            .bind(type_code)
            .bind(LISTING_CAP)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ItemDbRow::into_item).collect())
    }

    /// Bookmarked items that exist in the store, by name.
    pub async fn list_bookmarked(&self) -> Result<Vec<Item>, StorageError> {
        let sql = format!(
            r#"{}
            FROM dictionary_items i
            JOIN user_annotations ud ON ud.item_id = i.id
            WHERE ud.is_bookmarked = 1
            ORDER BY i.name COLLATE NOCASE, i.id
            LIMIT ?"#,
            ITEM_SELECT
        );
        let rows = sqlx::query_as::<_, ItemDbRow>(&sql)
            .bind(LISTING_CAP)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ItemDbRow::into_item).collect())
    }

    /// Most recently viewed items, newest first. Never-viewed items are excluded.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<Item>, StorageError> {
        let limit = limit.clamp(0, LISTING_CAP);
        let sql = format!(
            r#"{}
            FROM dictionary_items i
            JOIN user_annotations ud ON ud.item_id = i.id
            WHERE ud.last_viewed IS NOT NULL
            ORDER BY ud.last_viewed DESC, i.name COLLATE NOCASE
            LIMIT ?"#,
            ITEM_SELECT
        );
        let rows = sqlx::query_as::<_, ItemDbRow>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ItemDbRow::into_item).collect())
    }

    /// Every stored item with its annotation, by name.
    pub async fn export_all(&self) -> Result<Vec<Item>, StorageError> {
        let sql = format!(
            r#"{}
            FROM dictionary_items i
            LEFT JOIN user_annotations ud ON ud.item_id = i.id
            ORDER BY i.name COLLATE NOCASE, i.id"#,
            ITEM_SELECT
        );
        let rows = sqlx::query_as::<_, ItemDbRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ItemDbRow::into_item).collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Category, Database, NewItem};
    use pretty_assertions::assert_eq;

    fn item(id: &str, name: &str, code: Option<&str>, code_name: Option<&str>) -> NewItem {
        NewItem {
            id: id.to_string(),
            name: name.to_string(),
            type_code: code.map(str::to_string),
            type_name: code_name.map(str::to_string),
            ..Default::default()
        }
    }

    async fn seeded() -> Database {
        let db = Database::open(":memory:").await.unwrap();
        db.bulk_upsert_items(&[
            item("A", "Dolmen", Some("T1"), Some("Structure")),
            item("B", "Pottery", Some("T2"), Some("Artifact")),
            item("C", "Shell mound", Some("T1"), Some("Structure")),
            item("D", "Unsorted entry", None, None),
        ])
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_list_categories_counts_and_order() {
        let db = seeded().await;
        let categories = db.list_categories().await.unwrap();

        assert_eq!(
            categories,
            vec![
                Category {
                    id: Some("T2".into()),
                    name: Some("Artifact".into()),
                    count: 1
                },
                Category {
                    id: Some("T1".into()),
                    name: Some("Structure".into()),
                    count: 2
                },
                Category {
                    id: None,
                    name: None,
                    count: 1
                },
            ]
        );

        let total: i64 = categories.iter().map(|c| c.count).sum();
        assert_eq!(total, db.item_count().await.unwrap());
    }

    #[tokio::test]
    async fn test_list_categories_empty_store() {
        let db = Database::open(":memory:").await.unwrap();
        assert!(db.list_categories().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_by_category_sorted_by_name() {
        let db = seeded().await;

        let items = db.list_by_category("T1").await.unwrap();
        let names: Vec<_> = items.iter().map(|i| i.entry.name.as_str()).collect();
        assert_eq!(names, vec!["Dolmen", "Shell mound"]);

        assert!(db.list_by_category("T9").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_bookmarked_skips_missing_items() {
        let db = seeded().await;
        db.toggle_bookmark("C", true).await.unwrap();
        db.toggle_bookmark("A", true).await.unwrap();
        db.toggle_bookmark("ghost", true).await.unwrap();

        let items = db.list_bookmarked().await.unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.entry.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);
        assert!(items.iter().all(|i| i.annotation.is_bookmarked));
    }

    #[tokio::test]
    async fn test_list_recent_newest_first_with_limit() {
        let db = seeded().await;
        for id in ["B", "A", "C"] {
            db.get_item_by_id(id).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let recent = db.list_recent(2).await.unwrap();
        let ids: Vec<_> = recent.iter().map(|i| i.entry.id.as_str()).collect();
        assert_eq!(ids, vec!["C", "A"]);

        assert_eq!(db.list_recent(50).await.unwrap().len(), 3);
        assert!(db.list_recent(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_export_all_includes_annotations() {
        let db = seeded().await;
        db.save_note("B", "glazed").await.unwrap();

        let all = db.export_all().await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[1].entry.id, "B");
        assert_eq!(all[1].annotation.note.as_deref(), Some("glazed"));
        assert_eq!(all[0].annotation.note, None);
    }
}
