use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, quote_identifier, series_table_name},
};
use crate::models::{ProductId, SeriesPoint};

fn row_to_point(row: &Row) -> Result<SeriesPoint> {
    let captured_at: String = row.get("captured_at")?;
    Ok(SeriesPoint {
        value: row.get("value")?,
        captured_at: parse_datetime(&captured_at, "captured_at")?,
    })
}

/// Quoted table recorded for `product_id` in the catalog, if any.
fn catalog_table(conn: &Connection, product_id: &ProductId) -> Result<Option<String>> {
    let table_name: Option<String> = conn
        .query_row(
            "SELECT table_name FROM series_catalog WHERE product_id = ?1",
            params![product_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(table_name.map(|name| quote_identifier(&name)))
}

/// Creates the product's table and catalog entry on first write.
fn ensure_series_table(conn: &Connection, product_id: &ProductId) -> Result<String> {
    if let Some(table) = catalog_table(conn, product_id)? {
        return Ok(table);
    }

    let table_name = series_table_name(product_id);
    let table = quote_identifier(&table_name);
    let index = quote_identifier(&format!("idx_{table_name}_captured_at"));
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            value REAL NOT NULL,
            captured_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS {index} ON {table} (captured_at);"
    ))
    .with_context(|| format!("failed to create series table for product {product_id}"))?;

    conn.execute(
        "INSERT INTO series_catalog (product_id, table_name, created_at) VALUES (?1, ?2, ?3)",
        params![product_id.as_str(), table_name, format_datetime(&Utc::now())],
    )?;
    Ok(table)
}

impl Database {
    pub async fn append_point(&self, product_id: &ProductId, point: &SeriesPoint) -> Result<()> {
        let product_id = product_id.clone();
        let point = point.clone();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let table = ensure_series_table(&tx, &product_id)?;
            tx.execute(
                &format!("INSERT INTO {table} (value, captured_at) VALUES (?1, ?2)"),
                params![point.value, format_datetime(&point.captured_at)],
            )
            .with_context(|| format!("failed to append point to series {product_id}"))?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Points in ascending capture order. The window only applies when both
    /// bounds are given, and is then inclusive on both ends; with either bound
    /// missing the whole series is returned. Unknown products yield an empty
    /// series.
    pub async fn query_points(
        &self,
        product_id: &ProductId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<SeriesPoint>> {
        let product_id = product_id.clone();
        self.execute(move |conn| {
            let Some(table) = catalog_table(conn, &product_id)? else {
                return Ok(Vec::new());
            };

            let mut points = Vec::new();
            match (from, to) {
                (Some(from), Some(to)) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT value, captured_at FROM {table}
                         WHERE captured_at >= ?1 AND captured_at <= ?2
                         ORDER BY captured_at ASC, id ASC"
                    ))?;
                    let mut rows =
                        stmt.query(params![format_datetime(&from), format_datetime(&to)])?;
                    while let Some(row) = rows.next()? {
                        points.push(row_to_point(row)?);
                    }
                }
                _ => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT value, captured_at FROM {table}
                         ORDER BY captured_at ASC, id ASC"
                    ))?;
                    let mut rows = stmt.query([])?;
                    while let Some(row) = rows.next()? {
                        points.push(row_to_point(row)?);
                    }
                }
            }
            Ok(points)
        })
        .await
    }

    pub async fn product_exists(&self, product_id: &ProductId) -> Result<bool> {
        let product_id = product_id.clone();
        self.execute(move |conn| Ok(catalog_table(conn, &product_id)?.is_some()))
            .await
    }

    pub async fn list_products(&self) -> Result<Vec<ProductId>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT product_id FROM series_catalog ORDER BY created_at ASC, product_id ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut products = Vec::new();
            while let Some(row) = rows.next()? {
                let raw: String = row.get(0)?;
                products.push(ProductId::new(raw)?);
            }
            Ok(products)
        })
        .await
    }
}
