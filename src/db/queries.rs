pub const CREATE_KV_ENTRIES: &str = r#"
CREATE TABLE IF NOT EXISTS kv_entries (
    partition INT4 NOT NULL,
    space TEXT NOT NULL,
    key TEXT NOT NULL,
    sub_key TEXT NOT NULL COLLATE "C",
    value BYTEA NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (partition, space, key, sub_key)
);
"#;

pub const SELECT_ENTRY: &str = r#"
SELECT value FROM kv_entries
WHERE partition = $1 AND space = $2 AND key = $3 AND sub_key = $4;
"#;

pub const INSERT_ENTRY_IF_ABSENT: &str = r#"
INSERT INTO kv_entries (partition, space, key, sub_key, value)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (partition, space, key, sub_key) DO NOTHING;
"#;

pub const UPSERT_ENTRY: &str = r#"
INSERT INTO kv_entries (partition, space, key, sub_key, value)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (partition, space, key, sub_key) DO UPDATE
SET value = $5,
    updated_at = NOW();
"#;

pub const DELETE_ENTRY: &str = r#"
DELETE FROM kv_entries
WHERE partition = $1 AND space = $2 AND key = $3 AND sub_key = $4;
"#;

pub const SELECT_SUB_KEY_RANGE: &str = r#"
SELECT sub_key, value FROM kv_entries
WHERE partition = $1 AND space = $2 AND key = $3
  AND sub_key >= $4 AND sub_key < $5
ORDER BY sub_key;
"#;
