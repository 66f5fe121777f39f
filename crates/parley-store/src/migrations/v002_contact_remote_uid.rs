use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Account id returned by the registration lookup
ALTER TABLE contacts ADD COLUMN remote_uid TEXT;

CREATE INDEX IF NOT EXISTS idx_contacts_remote_uid ON contacts(remote_uid);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
