use anyhow::{Context, Result, bail};
use sqlx::{MySqlPool, Row};

/// Validate identifiers before interpolation into generated statements.
pub fn validate_ident(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > 64
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    {
        bail!("Invalid identifier: {}", name);
    }
    Ok(())
}

pub async fn table_exists(pool: &MySqlPool, table: &str) -> Result<bool> {
    validate_ident(table)?;
    let row = sqlx::query(
        r#"SELECT COUNT(*) AS cnt FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?"#,
    )
    .bind(table)
    .fetch_one(pool)
    .await
    .with_context(|| format!("Failed to check existence of {}", table))?;
    let cnt: i64 = row.try_get("cnt")?;
    Ok(cnt > 0)
}

/// True when the named object is a view rather than a base table.
pub async fn is_view(pool: &MySqlPool, table: &str) -> Result<bool> {
    validate_ident(table)?;
    let row = sqlx::query(
        r#"SELECT COUNT(*) AS cnt FROM INFORMATION_SCHEMA.VIEWS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?"#,
    )
    .bind(table)
    .fetch_one(pool)
    .await
    .with_context(|| format!("Failed to check whether {} is a view", table))?;
    let cnt: i64 = row.try_get("cnt")?;
    Ok(cnt > 0)
}

/// Discover all column names of a table or view in catalogue order.
pub async fn get_table_columns(pool: &MySqlPool, table: &str) -> Result<Vec<String>> {
    validate_ident(table)?;
    let rows = sqlx::query(
        r#"SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION"#,
    )
    .bind(table)
    .fetch_all(pool)
    .await
    .with_context(|| format!("Failed to query columns for {}", table))?;

    // Some MySQL setups return zero rows from INFORMATION_SCHEMA even when
    // the table exists; fall back to DESCRIBE to keep execution unblocked.
    if rows.is_empty() {
        let rows = sqlx::query(&format!("DESCRIBE `{}`", table))
            .fetch_all(pool)
            .await
            .with_context(|| format!("DESCRIBE fallback failed for {}", table))?;
        let mut columns = Vec::new();
        for r in rows {
            let name: String = r.try_get("Field")?;
            columns.push(name);
        }
        return Ok(columns);
    }

    let mut columns = Vec::new();
    for r in rows {
        let name: String = r.try_get("COLUMN_NAME")?;
        columns.push(name);
    }
    Ok(columns)
}

pub async fn count_rows(pool: &MySqlPool, table: &str) -> Result<i64> {
    validate_ident(table)?;
    let sql = format!("SELECT COUNT(*) AS cnt FROM `{}`", table);
    let row = sqlx::query(&sql)
        .fetch_one(pool)
        .await
        .with_context(|| format!("Failed to count rows in {}", table))?;
    let cnt: i64 = row.try_get("cnt")?;
    Ok(cnt)
}

pub async fn drop_table(pool: &MySqlPool, table: &str) -> Result<()> {
    validate_ident(table)?;
    let sql = format!("DROP TABLE IF EXISTS `{}`", table);
    sqlx::query(&sql)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to drop {}", table))?;
    Ok(())
}

pub async fn create_index(pool: &MySqlPool, table: &str, column: &str) -> Result<()> {
    validate_ident(table)?;
    validate_ident(column)?;
    let sql = format!(
        "CREATE INDEX `{table}_ix` ON `{table}` (`{column}`)",
        table = table,
        column = column
    );
    sqlx::query(&sql)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to index {} on {}", table, column))?;
    Ok(())
}

/// Run one generated statement and return the affected row count.
pub async fn execute_statement(pool: &MySqlPool, sql: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(sql).execute(pool).await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_ident_accepts_plain_names() {
        assert!(validate_ident("rapo_temp_comb_42").is_ok());
        assert!(validate_ident("call_date").is_ok());
    }

    #[test]
    fn test_validate_ident_rejects_injection() {
        assert!(validate_ident("x; drop table y").is_err());
        assert!(validate_ident("a`b").is_err());
        assert!(validate_ident("").is_err());
        assert!(validate_ident(&"a".repeat(65)).is_err());
    }
}
