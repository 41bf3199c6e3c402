use async_trait::async_trait;

use super::SqliteRepository;
use super::mapping::{conn, map_price_row, u64_to_i64};
use crate::repository::{PriceBookEntry, PriceBookRepository, StorageError};

#[async_trait]
impl PriceBookRepository for SqliteRepository {
    async fn get_entry(
        &self,
        provider: &str,
        model: &str,
    ) -> Result<Option<PriceBookEntry>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT provider, model, input_micro_usd_per_million,
                   cached_input_micro_usd_per_million, output_micro_usd_per_million, deprecated
            FROM price_book
            WHERE provider = ?1 AND model = ?2
            ",
        )
        .bind(provider)
        .bind(model)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?;

        row.as_ref().map(map_price_row).transpose()
    }

    async fn list_entries(&self) -> Result<Vec<PriceBookEntry>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT provider, model, input_micro_usd_per_million,
                   cached_input_micro_usd_per_million, output_micro_usd_per_million, deprecated
            FROM price_book
            ORDER BY provider, model
            ",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        rows.iter().map(map_price_row).collect()
    }

    async fn upsert_entry(&self, entry: &PriceBookEntry) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO price_book (
                provider, model, input_micro_usd_per_million,
                cached_input_micro_usd_per_million, output_micro_usd_per_million, deprecated
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(provider, model) DO UPDATE SET
                input_micro_usd_per_million = excluded.input_micro_usd_per_million,
                cached_input_micro_usd_per_million = excluded.cached_input_micro_usd_per_million,
                output_micro_usd_per_million = excluded.output_micro_usd_per_million,
                deprecated = excluded.deprecated
            ",
        )
        .bind(&entry.provider)
        .bind(&entry.model)
        .bind(u64_to_i64("input price", entry.input_micro_usd_per_million)?)
        .bind(u64_to_i64(
            "cached input price",
            entry.cached_input_micro_usd_per_million,
        )?)
        .bind(u64_to_i64("output price", entry.output_micro_usd_per_million)?)
        .bind(i64::from(entry.deprecated))
        .execute(&self.pool)
        .await
        .map_err(conn)?;

        Ok(())
    }
}
