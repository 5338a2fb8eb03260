//! Database schema management for `codemetal-stationalert`.
//!
//! Ensures required tables, unique constraints and indexes exist before the
//! engine starts. Applied once on startup from `main.rs` (EMBP: single
//! gateway call).

use anyhow::Result;
use sqlx::PgPool;

// ---

const STATEMENTS: &[&str] = &[
    // Stations and their activation history
    r#"
    CREATE TABLE IF NOT EXISTS weather_stations (
        id           BIGSERIAL PRIMARY KEY,
        name         TEXT             NOT NULL,
        uid          TEXT             NOT NULL UNIQUE,
        address      TEXT[]           NOT NULL DEFAULT '{}',
        latitude     DOUBLE PRECISION NOT NULL,
        longitude    DOUBLE PRECISION NOT NULL,
        initial_date TIMESTAMPTZ      NOT NULL DEFAULT now(),
        last_date    TIMESTAMPTZ
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS station_activity (
        station_id BIGINT      NOT NULL REFERENCES weather_stations (id),
        changed_at TIMESTAMPTZ NOT NULL,
        is_active  BOOLEAN     NOT NULL,
        PRIMARY KEY (station_id, changed_at)
    );
    "#,
    // Parameter types with calibration history
    r#"
    CREATE TABLE IF NOT EXISTS parameter_types (
        id           BIGSERIAL PRIMARY KEY,
        name         TEXT NOT NULL,
        measure_unit TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS parameter_calibrations (
        parameter_type_id BIGINT           NOT NULL REFERENCES parameter_types (id),
        effective_from    TIMESTAMPTZ      NOT NULL,
        offset_value      DOUBLE PRECISION NOT NULL,
        factor            DOUBLE PRECISION NOT NULL,
        qnt_decimals      INTEGER          NOT NULL CHECK (qnt_decimals >= 0),
        PRIMARY KEY (parameter_type_id, effective_from)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS parameters (
        id                BIGSERIAL PRIMARY KEY,
        parameter_type_id BIGINT NOT NULL REFERENCES parameter_types (id),
        station_id        BIGINT NOT NULL REFERENCES weather_stations (id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS parameter_activity (
        parameter_id BIGINT      NOT NULL REFERENCES parameters (id),
        changed_at   TIMESTAMPTZ NOT NULL,
        is_active    BOOLEAN     NOT NULL,
        PRIMARY KEY (parameter_id, changed_at)
    );
    "#,
    // Rule versions; a rule id owns several rows
    r#"
    CREATE TABLE IF NOT EXISTS type_alerts (
        id           BIGINT           NOT NULL,
        version      INTEGER          NOT NULL,
        parameter_id BIGINT           REFERENCES parameters (id),
        name         TEXT             NOT NULL,
        math_signal  TEXT             NOT NULL CHECK (math_signal IN ('<', '<=', '>', '>=', '==', '!=')),
        value        DOUBLE PRECISION NOT NULL,
        status       TEXT             NOT NULL CHECK (status IN ('draft', 'active', 'deprecated')),
        is_active    BOOLEAN          NOT NULL,
        valid_from   TIMESTAMPTZ      NOT NULL,
        valid_to     TIMESTAMPTZ,
        PRIMARY KEY (id, version)
    );
    "#,
    // Append-only facts
    r#"
    CREATE TABLE IF NOT EXISTS measures (
        id           BIGSERIAL PRIMARY KEY,
        parameter_id BIGINT           NOT NULL REFERENCES parameters (id),
        value        DOUBLE PRECISION NOT NULL,
        raw_value    DOUBLE PRECISION NOT NULL,
        observed_at  TIMESTAMPTZ      NOT NULL,
        ingested_at  TIMESTAMPTZ      NOT NULL DEFAULT now(),
        reading_key  TEXT,
        UNIQUE (parameter_id, reading_key)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id                 BIGSERIAL PRIMARY KEY,
        measure_id         BIGINT      NOT NULL REFERENCES measures (id),
        type_alert_id      BIGINT      NOT NULL,
        type_alert_version INTEGER     NOT NULL,
        triggered_at       TIMESTAMPTZ NOT NULL,
        start_date         TIMESTAMPTZ NOT NULL DEFAULT now(),
        is_read            BOOLEAN     NOT NULL DEFAULT FALSE,
        read_at            TIMESTAMPTZ,
        notified_at        TIMESTAMPTZ,
        UNIQUE (measure_id, type_alert_id),
        FOREIGN KEY (type_alert_id, type_alert_version) REFERENCES type_alerts (id, version)
    );
    "#,
    r#"
    ALTER TABLE alerts ADD COLUMN IF NOT EXISTS notified_at TIMESTAMPTZ;
    "#,
    // Basic indexes for common lookups
    r#"
    CREATE INDEX IF NOT EXISTS idx_measures_parameter_observed
        ON measures (parameter_id, observed_at);
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_alerts_unread
        ON alerts (is_read) WHERE NOT is_read;
    "#,
];

/// Create or update the database schema (idempotent).
///
/// Safe to call on every startup; no-op if objects already exist. Errors are
/// propagated if any SQL execution fails and the transaction is rolled back.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    for statement in STATEMENTS {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    tracing::info!(statements = STATEMENTS.len(), "Database schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_uniqueness_keys_declared() {
        // ---
        let ddl = STATEMENTS.join("\n");
        assert!(ddl.contains("UNIQUE (measure_id, type_alert_id)"));
        assert!(ddl.contains("UNIQUE (parameter_id, reading_key)"));
        assert!(ddl.contains("PRIMARY KEY (id, version)"));
    }

    #[test]
    fn test_statements_are_idempotent() {
        // ---
        for statement in STATEMENTS {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "statement is not idempotent: {statement}"
            );
        }
    }
}
