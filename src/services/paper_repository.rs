use crate::error::{AppError, AppResult};
use crate::models::paper::{Paper, ProcessingStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqliteConnection};

/// Persistence for paper records. Every method runs on a caller-supplied
/// connection, so agents go through the pool manager rather than a private
/// sqlx pool.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub total: i64,
    pub pending: i64,
    pub processed: i64,
    pub error: i64,
    pub downloaded: i64,
}

fn encode_json<T: serde::Serialize>(value: &T) -> AppResult<String> {
    serde_json::to_string(value)
        .map_err(|e| AppError::Internal(format!("Failed to encode JSON field: {e}")))
}

fn row_to_paper(row: &sqlx::sqlite::SqliteRow) -> Paper {
    let authors: String = row.get("authors");
    let categories: String = row.get("categories");
    let source_metadata: String = row.get("source_metadata");
    let status: String = row.get("processing_status");

    Paper {
        paper_id: row.get("paper_id"),
        source: row.get("source"),
        title: row.get("title"),
        authors: serde_json::from_str(&authors).unwrap_or_default(),
        abstract_text: row.get("abstract_text"),
        categories: serde_json::from_str(&categories).unwrap_or_default(),
        date_published: row.get::<Option<DateTime<Utc>>, _>("date_published"),
        date_updated: row.get::<Option<DateTime<Utc>>, _>("date_updated"),
        pdf_url: row.get("pdf_url"),
        pdf_downloaded: row.get("pdf_downloaded"),
        pdf_file_path: row.get("pdf_file_path"),
        pdf_file_size: row.get("pdf_file_size"),
        source_metadata: serde_json::from_str(&source_metadata)
            .unwrap_or(serde_json::Value::Null),
        processing_status: ProcessingStatus::parse(&status),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// Insert a paper or refresh its metadata. Download bookkeeping
/// (`pdf_downloaded`, path, size) is deliberately left alone on conflict:
/// a metadata refresh must not forget that the PDF is already on disk.
pub async fn upsert_paper(conn: &mut SqliteConnection, paper: &Paper) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO papers (
            source, paper_id, title, authors, abstract_text, categories,
            date_published, date_updated, pdf_url, pdf_downloaded,
            pdf_file_path, pdf_file_size, source_metadata, processing_status,
            created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source, paper_id) DO UPDATE SET
            title = excluded.title,
            authors = excluded.authors,
            abstract_text = excluded.abstract_text,
            categories = excluded.categories,
            date_published = excluded.date_published,
            date_updated = excluded.date_updated,
            pdf_url = excluded.pdf_url,
            source_metadata = excluded.source_metadata,
            processing_status = excluded.processing_status,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&paper.source)
    .bind(&paper.paper_id)
    .bind(&paper.title)
    .bind(encode_json(&paper.authors)?)
    .bind(&paper.abstract_text)
    .bind(encode_json(&paper.categories)?)
    .bind(paper.date_published)
    .bind(paper.date_updated)
    .bind(&paper.pdf_url)
    .bind(paper.pdf_downloaded)
    .bind(&paper.pdf_file_path)
    .bind(paper.pdf_file_size)
    .bind(encode_json(&paper.source_metadata)?)
    .bind(paper.processing_status.to_string())
    .bind(paper.created_at)
    .bind(paper.updated_at)
    .execute(conn)
    .await
    .map_err(|e| AppError::Database(format!("Failed to upsert paper: {e}")))?;

    Ok(())
}

pub async fn get_paper(
    conn: &mut SqliteConnection,
    source: &str,
    paper_id: &str,
) -> AppResult<Option<Paper>> {
    let row = sqlx::query("SELECT * FROM papers WHERE source = ? AND paper_id = ?")
        .bind(source)
        .bind(paper_id)
        .fetch_optional(conn)
        .await
        .map_err(|e| AppError::Database(format!("Failed to get paper: {e}")))?;

    Ok(row.as_ref().map(row_to_paper))
}

/// Papers with a PDF URL whose file has not been archived yet.
pub async fn pending_downloads(conn: &mut SqliteConnection, limit: i64) -> AppResult<Vec<Paper>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM papers
        WHERE pdf_downloaded = 0 AND pdf_url != '' AND processing_status = 'pending'
        ORDER BY created_at
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(|e| AppError::Database(format!("Failed to list pending downloads: {e}")))?;

    Ok(rows.iter().map(row_to_paper).collect())
}

pub async fn mark_downloaded(
    conn: &mut SqliteConnection,
    source: &str,
    paper_id: &str,
    path: &str,
    size: i64,
) -> AppResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE papers
        SET pdf_downloaded = 1, pdf_file_path = ?, pdf_file_size = ?,
            processing_status = 'processed', updated_at = ?
        WHERE source = ? AND paper_id = ?
        "#,
    )
    .bind(path)
    .bind(size)
    .bind(Utc::now())
    .bind(source)
    .bind(paper_id)
    .execute(conn)
    .await
    .map_err(|e| AppError::Database(format!("Failed to update download status: {e}")))?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Paper not found: {source}/{paper_id}")));
    }
    Ok(())
}

pub async fn mark_error(
    conn: &mut SqliteConnection,
    source: &str,
    paper_id: &str,
) -> AppResult<()> {
    let result = sqlx::query(
        "UPDATE papers SET processing_status = 'error', updated_at = ? WHERE source = ? AND paper_id = ?",
    )
    .bind(Utc::now())
    .bind(source)
    .bind(paper_id)
    .execute(conn)
    .await
    .map_err(|e| AppError::Database(format!("Failed to mark paper errored: {e}")))?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Paper not found: {source}/{paper_id}")));
    }
    Ok(())
}

pub async fn collection_stats(conn: &mut SqliteConnection) -> AppResult<CollectionStats> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            SUM(processing_status = 'pending') AS pending,
            SUM(processing_status = 'processed') AS processed,
            SUM(processing_status = 'error') AS error,
            SUM(pdf_downloaded = 1) AS downloaded
        FROM papers
        "#,
    )
    .fetch_one(conn)
    .await
    .map_err(|e| AppError::Database(format!("Failed to read collection stats: {e}")))?;

    Ok(CollectionStats {
        total: row.get("total"),
        pending: row.get::<Option<i64>, _>("pending").unwrap_or(0),
        processed: row.get::<Option<i64>, _>("processed").unwrap_or(0),
        error: row.get::<Option<i64>, _>("error").unwrap_or(0),
        downloaded: row.get::<Option<i64>, _>("downloaded").unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::ConnectOptions;
    use std::str::FromStr;

    async fn test_conn() -> SqliteConnection {
        let mut conn = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .connect()
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&mut conn).await.unwrap();
        conn
    }

    fn sample_paper(id: &str) -> Paper {
        let mut paper = Paper::new(
            id.to_string(),
            "arxiv".to_string(),
            format!("Paper {id}"),
            format!("https://arxiv.org/pdf/{id}"),
        );
        paper.authors = vec!["A. Author".to_string(), "B. Author".to_string()];
        paper.categories = vec!["cs.LG".to_string()];
        paper.abstract_text = "We study things.".to_string();
        paper.date_published = Some(Utc::now());
        paper.source_metadata = serde_json::json!({"comment": "12 pages"});
        paper
    }

    #[tokio::test]
    async fn upsert_and_get_round_trip() {
        let mut conn = test_conn().await;
        let paper = sample_paper("2301.00001");
        upsert_paper(&mut conn, &paper).await.unwrap();

        let loaded = get_paper(&mut conn, "arxiv", "2301.00001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.title, paper.title);
        assert_eq!(loaded.authors, paper.authors);
        assert_eq!(loaded.categories, paper.categories);
        assert_eq!(loaded.processing_status, ProcessingStatus::Pending);
        assert_eq!(loaded.source_metadata, paper.source_metadata);
        assert!(!loaded.pdf_downloaded);

        assert!(get_paper(&mut conn, "arxiv", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn metadata_refresh_keeps_download_state() {
        let mut conn = test_conn().await;
        let paper = sample_paper("2301.00002");
        upsert_paper(&mut conn, &paper).await.unwrap();
        mark_downloaded(&mut conn, "arxiv", "2301.00002", "papers/arxiv/2301/2301.00002.pdf", 4321)
            .await
            .unwrap();

        let mut refreshed = sample_paper("2301.00002");
        refreshed.title = "Updated title".to_string();
        upsert_paper(&mut conn, &refreshed).await.unwrap();

        let loaded = get_paper(&mut conn, "arxiv", "2301.00002")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.title, "Updated title");
        assert!(loaded.pdf_downloaded);
        assert_eq!(loaded.pdf_file_size, Some(4321));
        assert!(loaded.pdf_file_path.is_some());
    }

    #[tokio::test]
    async fn pending_downloads_excludes_archived_and_errored() {
        let mut conn = test_conn().await;
        upsert_paper(&mut conn, &sample_paper("2301.00001")).await.unwrap();
        upsert_paper(&mut conn, &sample_paper("2301.00002")).await.unwrap();
        upsert_paper(&mut conn, &sample_paper("2301.00003")).await.unwrap();

        mark_downloaded(&mut conn, "arxiv", "2301.00001", "papers/a.pdf", 10)
            .await
            .unwrap();
        mark_error(&mut conn, "arxiv", "2301.00002").await.unwrap();

        let pending = pending_downloads(&mut conn, 100).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].paper_id, "2301.00003");
    }

    #[tokio::test]
    async fn status_updates_on_missing_papers_are_not_found() {
        let mut conn = test_conn().await;
        let err = mark_downloaded(&mut conn, "arxiv", "nope", "x.pdf", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = mark_error(&mut conn, "arxiv", "nope").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn collection_stats_counts_by_status() {
        let mut conn = test_conn().await;
        for id in ["a", "b", "c", "d"] {
            upsert_paper(&mut conn, &sample_paper(id)).await.unwrap();
        }
        mark_downloaded(&mut conn, "arxiv", "a", "papers/a.pdf", 10).await.unwrap();
        mark_error(&mut conn, "arxiv", "b").await.unwrap();

        let stats = collection_stats(&mut conn).await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.error, 1);
        assert_eq!(stats.downloaded, 1);
    }
}
