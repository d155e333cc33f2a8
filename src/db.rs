//! Local SQLite database layer for Bistro POS.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings
//! helpers, and shared connection state passed to every service by
//! reference (no global singletons).

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::PosError;

/// Shared database state holding the connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection, mapping a poisoned mutex to a crate error.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, PosError> {
        self.conn
            .lock()
            .map_err(|e| PosError::Internal(format!("db lock poisoned: {e}")))
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/bistro.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, PosError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| PosError::Internal(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join("bistro.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open an in-memory database with the full schema. For tests and
/// ephemeral tooling.
pub fn init_in_memory() -> Result<DbState, PosError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, PosError> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), PosError> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: orders, bills, items, tables, settings.
fn migrate_v1(conn: &Connection) -> Result<(), PosError> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- orders
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            order_number TEXT,
            order_type TEXT NOT NULL DEFAULT 'dine_in'
                CHECK(order_type IN ('dine_in', 'takeaway', 'delivery')),
            status TEXT NOT NULL DEFAULT 'draft',
            table_id TEXT,
            is_closed INTEGER NOT NULL DEFAULT 0,
            closed_at TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- bills
        CREATE TABLE IF NOT EXISTS bills (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            name TEXT,
            status TEXT NOT NULL DEFAULT 'active'
                CHECK(status IN ('active', 'closed', 'cancelled')),
            payment_status TEXT NOT NULL DEFAULT 'unpaid'
                CHECK(payment_status IN ('unpaid', 'new', 'paid')),
            discount_amount REAL NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- order_items
        CREATE TABLE IF NOT EXISTS order_items (
            id TEXT PRIMARY KEY,
            bill_id TEXT NOT NULL REFERENCES bills(id) ON DELETE CASCADE,
            order_id TEXT NOT NULL,
            menu_item_id TEXT NOT NULL,
            variant_id TEXT,
            item_name TEXT NOT NULL,
            quantity REAL NOT NULL DEFAULT 1,
            unit_price REAL NOT NULL DEFAULT 0,
            discount_amount REAL NOT NULL DEFAULT 0,
            department TEXT NOT NULL DEFAULT 'kitchen'
                CHECK(department IN ('kitchen', 'bar')),
            status TEXT NOT NULL DEFAULT 'waiting',
            payment_status TEXT NOT NULL DEFAULT 'unpaid'
                CHECK(payment_status IN ('unpaid', 'new', 'paid')),
            payment_transaction_id TEXT,
            paid_at TEXT,
            cancelled_reason TEXT,
            modifier_ids TEXT NOT NULL DEFAULT '[]',
            sent_to_kitchen_at TEXT,
            prepared_at TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- tables (occupancy is derived, never stored)
        CREATE TABLE IF NOT EXISTS tables (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            active_order_id TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_bills_order ON bills(order_id);
        CREATE INDEX IF NOT EXISTS idx_items_bill ON order_items(bill_id);
        CREATE INDEX IF NOT EXISTS idx_items_order ON order_items(order_id);
        CREATE INDEX IF NOT EXISTS idx_items_status ON order_items(status);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;
    Ok(())
}

/// Migration v2: inventory batches and write-off machinery.
fn migrate_v2(conn: &Connection) -> Result<(), PosError> {
    conn.execute_batch(
        "
        -- storage_batches (FIFO ledger; quantity may go negative)
        CREATE TABLE IF NOT EXISTS storage_batches (
            id TEXT PRIMARY KEY,
            item_id TEXT NOT NULL,
            batch_number TEXT NOT NULL,
            initial_quantity REAL NOT NULL,
            current_quantity REAL NOT NULL,
            unit TEXT NOT NULL DEFAULT 'g',
            cost_per_unit REAL NOT NULL DEFAULT 0,
            receipt_date TEXT NOT NULL,
            source_type TEXT NOT NULL DEFAULT 'purchase'
                CHECK(source_type IN ('purchase', 'production', 'correction')),
            is_negative INTEGER NOT NULL DEFAULT 0,
            reconciled_at TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- writeoff_operations (append-only)
        CREATE TABLE IF NOT EXISTS writeoff_operations (
            id TEXT PRIMARY KEY,
            order_item_id TEXT,
            department TEXT,
            reason TEXT NOT NULL DEFAULT 'sales_consumption'
                CHECK(reason IN ('sales_consumption', 'inventory_correction', 'spoilage')),
            total_value REAL NOT NULL DEFAULT 0,
            allocations TEXT NOT NULL DEFAULT '[]',
            notes TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- write-off state on items
        ALTER TABLE order_items ADD COLUMN write_off_status TEXT NOT NULL DEFAULT 'pending'
            CHECK(write_off_status IN ('pending', 'processing', 'completed'));
        ALTER TABLE order_items ADD COLUMN write_off_updated_at TEXT;
        ALTER TABLE order_items ADD COLUMN write_off_operation_id TEXT;
        ALTER TABLE order_items ADD COLUMN actual_cost REAL;
        ALTER TABLE order_items ADD COLUMN cost_breakdown TEXT;

        CREATE INDEX IF NOT EXISTS idx_batches_item ON storage_batches(item_id, receipt_date);
        CREATE INDEX IF NOT EXISTS idx_items_write_off ON order_items(write_off_status);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )?;
    Ok(())
}

/// Migration v3: payments, payment history, settlement accounts.
fn migrate_v3(conn: &Connection) -> Result<(), PosError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            balance REAL NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS payments (
            id TEXT PRIMARY KEY,
            bill_id TEXT NOT NULL REFERENCES bills(id) ON DELETE CASCADE,
            order_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            method TEXT NOT NULL DEFAULT 'cash'
                CHECK(method IN ('cash', 'card', 'qr')),
            amount REAL NOT NULL,
            cost_of_goods REAL,
            status TEXT NOT NULL DEFAULT 'completed',
            processed_by TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- payment_events (append-only per-bill history)
        CREATE TABLE IF NOT EXISTS payment_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            bill_id TEXT NOT NULL,
            payment_id TEXT,
            event_type TEXT NOT NULL,
            amount REAL NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_payments_bill ON payments(bill_id);
        CREATE INDEX IF NOT EXISTS idx_payment_events_bill ON payment_events(bill_id);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Read a setting value; returns `None` on miss.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings
         WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Upsert a setting value.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), PosError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key)
         DO UPDATE SET setting_value = ?3, updated_at = datetime('now')",
        params![category, key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

/// Run all migrations against an externally-opened connection.
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================
