use sqlx::SqlitePool;

use crate::error::Result;

/// Raw sale row as stored. Conversion to a comparable (margin, days held)
/// happens in the internal engine.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SaleRow {
    pub brand: String,
    pub model: String,
    pub build_year: Option<i64>,
    pub mileage: Option<i64>,
    pub purchase_price: Option<f64>,
    pub selling_price: Option<f64>,
    pub purchase_date: Option<String>,
    pub sold_date: Option<String>,
    pub channel: String,
}

const SELECT_COLUMNS: &str = "SELECT brand, model, build_year, mileage, purchase_price, \
     selling_price, purchase_date, sold_date, channel FROM sales";

#[derive(Clone)]
pub struct SalesRepo {
    pool: SqlitePool,
}

impl SalesRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Sold rows since `since_date` (ISO date) matching brand exactly and
    /// model by prefix, with both prices recorded.
    pub async fn sold_by_brand_and_model_prefix(
        &self,
        brand: &str,
        model_prefix: &str,
        since_date: &str,
    ) -> Result<Vec<SaleRow>> {
        let pattern = format!("{}%", escape_like(model_prefix));
        let sql = format!(
            "{SELECT_COLUMNS} \
             WHERE status = 'sold' \
               AND sold_date >= ? \
               AND LOWER(brand) = LOWER(?) \
               AND LOWER(model) LIKE LOWER(?) ESCAPE '\\' \
               AND purchase_price IS NOT NULL \
               AND selling_price IS NOT NULL \
             ORDER BY sold_date DESC"
        );
        let rows = sqlx::query_as::<_, SaleRow>(&sql)
            .bind(since_date)
            .bind(brand)
            .bind(pattern)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Widened form: brand only, any model.
    pub async fn sold_by_brand(&self, brand: &str, since_date: &str) -> Result<Vec<SaleRow>> {
        let sql = format!(
            "{SELECT_COLUMNS} \
             WHERE status = 'sold' \
               AND sold_date >= ? \
               AND LOWER(brand) = LOWER(?) \
               AND purchase_price IS NOT NULL \
               AND selling_price IS NOT NULL \
             ORDER BY sold_date DESC"
        );
        let rows = sqlx::query_as::<_, SaleRow>(&sql)
            .bind(since_date)
            .bind(brand)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

/// Escape LIKE wildcards in user-derived text.
fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
pub async fn insert_sale(
    pool: &SqlitePool,
    brand: &str,
    model: &str,
    purchase_price: Option<f64>,
    selling_price: Option<f64>,
    purchase_date: Option<&str>,
    sold_date: Option<&str>,
    channel: &str,
) {
    sqlx::query(
        "INSERT INTO sales (brand, model, build_year, mileage, purchase_price, selling_price, \
         purchase_date, sold_date, status, channel) VALUES (?, ?, NULL, NULL, ?, ?, ?, ?, 'sold', ?)",
    )
    .bind(brand)
    .bind(model)
    .bind(purchase_price)
    .bind(selling_price)
    .bind(purchase_date)
    .bind(sold_date)
    .bind(channel)
    .execute(pool)
    .await
    .unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_memory;

    #[test]
    fn like_escaping() {
        assert_eq!(escape_like("golf"), "golf");
        assert_eq!(escape_like("10%_x"), "10\\%\\_x");
    }

    #[tokio::test]
    async fn model_prefix_query_filters_unpriced_rows() {
        let pool = connect_memory().await.unwrap();
        let repo = SalesRepo::new(pool.clone());

        insert_sale(&pool, "Volkswagen", "Golf GTI", Some(15000.0), Some(17500.0),
            Some("2026-01-10"), Some("2026-02-01"), "b2c").await;
        insert_sale(&pool, "Volkswagen", "Golf", None, Some(16000.0),
            Some("2026-01-10"), Some("2026-02-01"), "b2c").await;
        insert_sale(&pool, "Volkswagen", "Polo", Some(9000.0), Some(10500.0),
            Some("2026-01-10"), Some("2026-02-01"), "b2b").await;

        let rows = repo
            .sold_by_brand_and_model_prefix("volkswagen", "golf", "2025-08-05")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].model, "Golf GTI");

        let all = repo.sold_by_brand("Volkswagen", "2025-08-05").await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn old_sales_fall_outside_the_window() {
        let pool = connect_memory().await.unwrap();
        let repo = SalesRepo::new(pool.clone());

        insert_sale(&pool, "BMW", "320i", Some(20000.0), Some(23000.0),
            Some("2024-01-10"), Some("2024-02-01"), "b2c").await;

        let rows = repo.sold_by_brand("BMW", "2025-08-05").await.unwrap();
        assert!(rows.is_empty());
    }
}
