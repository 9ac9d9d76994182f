use crate::error::Result;
use crate::record::NormalizedRecord;
use crate::resources::Resource;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::LazyLock;

static RE_PLAIN_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d+(\.\d+)?$").expect("valid number regex"));

const DEFAULT_DB_POOL_SIZE: u32 = 4;

fn db_pool_size() -> u32 {
    if let Ok(raw) = std::env::var("AIMETA_DB_POOL_SIZE") {
        if let Ok(parsed) = raw.parse::<u32>() {
            return parsed.clamp(1, 32);
        }
    }

    std::thread::available_parallelism()
        .map(|count| count.get() as u32)
        .unwrap_or(DEFAULT_DB_POOL_SIZE)
        .min(DEFAULT_DB_POOL_SIZE)
        .max(2)
}

fn apply_connection_pragmas(conn: &Connection) -> SqlResult<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys=ON;
         PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA temp_store=MEMORY;
         PRAGMA busy_timeout=5000;",
    )?;
    Ok(())
}

/// Lookup row mapping a model version id to its resolved identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelVersionRow {
    pub model_version_id: i64,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub urn: Option<String>,
    pub sha256: Option<String>,
    pub extra_json: Option<String>,
}

/// A `resources` row still carrying an unresolved reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRefRow {
    pub rowid: i64,
    pub image_id: String,
    pub kind: String,
    pub name: Option<String>,
    pub hash: Option<String>,
    pub weight: Option<f64>,
    pub extra_json: Option<String>,
}

/// Thread-safe database wrapper backed by an r2d2 connection pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Opens or creates the SQLite database at the given path using a
    /// connection pool, and makes sure the schema exists.
    pub fn new(db_path: &Path) -> Result<Self> {
        let manager =
            SqliteConnectionManager::file(db_path).with_init(|conn| apply_connection_pragmas(conn));
        let pool = Pool::builder().max_size(db_pool_size()).build(manager)?;

        let db = Database { pool };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS images (
                id TEXT PRIMARY KEY,
                source_file TEXT UNIQUE NOT NULL,
                file_name TEXT,
                ext TEXT,
                width INTEGER,
                height INTEGER,
                created_utc TEXT,
                imported_utc TEXT,
                sha256 TEXT,
                format_hint TEXT,
                raw_text_preview TEXT
            );

            CREATE TABLE IF NOT EXISTS kv (
                image_id TEXT NOT NULL,
                k TEXT NOT NULL,
                v TEXT,
                v_num REAL,
                v_json TEXT,
                UNIQUE(image_id, k),
                FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS resources (
                image_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                name TEXT,
                version TEXT,
                hash TEXT,
                weight REAL,
                extra_json TEXT,
                FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS model_versions (
                model_version_id INTEGER PRIMARY KEY,
                kind TEXT,
                name TEXT,
                urn TEXT,
                sha256 TEXT,
                extra_json TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_kv_k ON kv(k);
            CREATE INDEX IF NOT EXISTS idx_resources_image ON resources(image_id);
            CREATE INDEX IF NOT EXISTS idx_mv_sha256 ON model_versions(sha256);
            CREATE INDEX IF NOT EXISTS idx_mv_urn ON model_versions(urn);",
        )?;

        Ok(())
    }

    /// Upserts one normalized record: the `images` row keyed on its source
    /// path, then one `kv` row per entry with the value split across the
    /// typed columns (numbers fill `v_num` plus text, containers fill
    /// `v_json`, everything else is text with a numeric parse attempt).
    pub fn upsert_record(&self, rec: &NormalizedRecord) -> Result<()> {
        let conn = self.conn()?;
        upsert_record_tx(&conn, rec)
    }

    /// Upserts a whole batch inside a single transaction.
    pub fn upsert_records(&self, recs: &[NormalizedRecord]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for rec in recs {
            upsert_record_tx(&tx, rec)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Returns `(image_id, workflow_json_text)` for every stored workflow.
    pub fn workflow_json_rows(&self, limit: usize) -> Result<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut sql = String::from(
            "SELECT image_id, v_json FROM kv WHERE k='workflow_json' AND v_json IS NOT NULL",
        );
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Replaces the resources of one image in a single transaction, so a
    /// repeated extraction pass rebuilds rather than accumulates.
    pub fn replace_resources(&self, image_id: &str, items: &[Resource]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM resources WHERE image_id=?1", params![image_id])?;
        for item in items {
            let extra_json = match &item.extra {
                Some(extra) => Some(serde_json::to_string(extra)?),
                None => None,
            };
            tx.execute(
                "INSERT INTO resources(image_id, kind, name, version, hash, weight, extra_json)
                 VALUES(?1,?2,?3,?4,?5,?6,?7)",
                params![
                    image_id,
                    item.kind,
                    item.name,
                    item.version,
                    item.hash,
                    item.weight,
                    extra_json
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn resources_for_image(&self, image_id: &str) -> Result<Vec<ResourceRefRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT rowid, image_id, kind, name, hash, weight, extra_json
             FROM resources WHERE image_id=?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![image_id], resource_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Upserts a model-version lookup row. On conflict every column keeps
    /// its earlier non-null value unless the incoming row provides one.
    pub fn upsert_model_version(&self, row: &ModelVersionRow) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO model_versions(model_version_id, kind, name, urn, sha256, extra_json)
             VALUES(?1,?2,?3,?4,?5,?6)
             ON CONFLICT(model_version_id) DO UPDATE SET
               kind=COALESCE(excluded.kind, model_versions.kind),
               name=COALESCE(excluded.name, model_versions.name),
               urn=COALESCE(excluded.urn, model_versions.urn),
               sha256=COALESCE(excluded.sha256, model_versions.sha256),
               extra_json=COALESCE(excluded.extra_json, model_versions.extra_json)",
            params![
                row.model_version_id,
                row.kind,
                row.name,
                row.urn,
                row.sha256,
                row.extra_json
            ],
        )?;
        Ok(())
    }

    pub fn model_version(&self, model_version_id: i64) -> Result<Option<ModelVersionRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT model_version_id, kind, name, urn, sha256, extra_json
                 FROM model_versions WHERE model_version_id=?1",
                params![model_version_id],
                |row| {
                    Ok(ModelVersionRow {
                        model_version_id: row.get(0)?,
                        kind: row.get(1)?,
                        name: row.get(2)?,
                        urn: row.get(3)?,
                        sha256: row.get(4)?,
                        extra_json: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// All `resources` rows still holding an unresolved model-version
    /// reference.
    pub fn resource_ref_rows(&self) -> Result<Vec<ResourceRefRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT rowid, image_id, kind, name, hash, weight, extra_json
             FROM resources
             WHERE kind='resource_ref' AND name LIKE 'modelVersionId:%'",
        )?;
        let rows = stmt
            .query_map([], resource_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Rewrites one resolved resource row in place.
    pub fn rewrite_resource_row(
        &self,
        rowid: i64,
        kind: &str,
        name: &str,
        hash: Option<&str>,
        extra_json: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE resources SET kind=?1, name=?2, hash=?3, extra_json=?4 WHERE rowid=?5",
            params![kind, name, hash, extra_json, rowid],
        )?;
        Ok(())
    }

    #[cfg(test)]
    fn kv_row(&self, image_id: &str, k: &str) -> Result<Option<(Option<String>, Option<f64>, Option<String>)>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT v, v_num, v_json FROM kv WHERE image_id=?1 AND k=?2",
                params![image_id, k],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(row)
    }
}

fn resource_row(row: &Row<'_>) -> SqlResult<ResourceRefRow> {
    Ok(ResourceRefRow {
        rowid: row.get(0)?,
        image_id: row.get(1)?,
        kind: row.get(2)?,
        name: row.get(3)?,
        hash: row.get(4)?,
        weight: row.get(5)?,
        extra_json: row.get(6)?,
    })
}

/// The three-slot kv typing rule.
fn kv_slots(v: &Value) -> (Option<String>, Option<f64>, Option<String>) {
    match v {
        Value::Number(n) => (Some(n.to_string()), n.as_f64(), None),
        Value::Object(_) | Value::Array(_) => {
            (None, None, Some(serde_json::to_string(v).unwrap_or_default()))
        }
        Value::String(s) => {
            let v_num = if RE_PLAIN_NUMBER.is_match(s.trim()) {
                s.trim().parse::<f64>().ok()
            } else {
                None
            };
            (Some(s.clone()), v_num, None)
        }
        Value::Bool(b) => (Some(b.to_string()), None, None),
        Value::Null => (None, None, None),
    }
}

fn upsert_record_tx(conn: &Connection, rec: &NormalizedRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO images(id, source_file, file_name, ext, width, height, created_utc,
                            imported_utc, sha256, format_hint, raw_text_preview)
         VALUES(?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
         ON CONFLICT(source_file) DO UPDATE SET
           file_name=excluded.file_name,
           ext=excluded.ext,
           width=excluded.width,
           height=excluded.height,
           sha256=excluded.sha256,
           format_hint=excluded.format_hint,
           raw_text_preview=excluded.raw_text_preview",
        params![
            rec.id,
            rec.source_file,
            rec.file_name,
            rec.ext,
            rec.width,
            rec.height,
            rec.created_utc,
            rec.imported_utc,
            rec.sha256,
            rec.format_hint,
            rec.raw_text_preview
        ],
    )?;

    for (k, v) in &rec.kv {
        let (v_text, v_num, v_json) = kv_slots(v);
        conn.execute(
            "INSERT INTO kv(image_id, k, v, v_num, v_json)
             VALUES(?1,?2,?3,?4,?5)
             ON CONFLICT(image_id, k) DO UPDATE SET
               v=excluded.v,
               v_num=excluded.v_num,
               v_json=excluded.v_json",
            params![rec.id, k, v_text, v_num, v_json],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("images.db")).expect("database");
        (dir, db)
    }

    fn sample_record(id: &str, source: &str) -> NormalizedRecord {
        NormalizedRecord {
            id: id.to_string(),
            source_file: source.to_string(),
            file_name: Some("a.png".to_string()),
            ext: Some("png".to_string()),
            width: Some(832),
            height: Some(1216),
            imported_utc: "2026-01-01T00:00:00Z".to_string(),
            created_utc: None,
            sha256: None,
            format_hint: Some("a1111_like".to_string()),
            prompt: Some("a cat".to_string()),
            negative_prompt: None,
            steps: Some(30),
            cfg_scale: Some(7.5),
            seed: Some(42),
            sampler: Some("Euler a".to_string()),
            scheduler: None,
            model: None,
            raw_text_preview: None,
            workflow_json: None,
            resources: Vec::new(),
            kv: [
                ("prompt".to_string(), json!("a cat")),
                ("steps".to_string(), json!(30)),
                ("seed_text".to_string(), json!("42")),
                ("prompt_tokens".to_string(), json!([{"t": "a cat", "t_norm": "a cat", "w": 1.0}])),
            ]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn kv_typing_uses_exactly_one_payload_shape() {
        let (num_text, num, num_json) = kv_slots(&json!(30));
        assert_eq!(num_text.as_deref(), Some("30"));
        assert_eq!(num, Some(30.0));
        assert_eq!(num_json, None);

        let (text, text_num, text_json) = kv_slots(&json!("hello"));
        assert_eq!(text.as_deref(), Some("hello"));
        assert_eq!(text_num, None);
        assert_eq!(text_json, None);

        let (numish_text, numish_num, _) = kv_slots(&json!("-12.5"));
        assert_eq!(numish_text.as_deref(), Some("-12.5"));
        assert_eq!(numish_num, Some(-12.5));

        let (obj_text, obj_num, obj_json) = kv_slots(&json!({"a": 1}));
        assert_eq!(obj_text, None);
        assert_eq!(obj_num, None);
        assert_eq!(obj_json.as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn upsert_is_idempotent_on_source_file() {
        let (_dir, db) = test_db();
        let rec = sample_record("id-1", "input/a.png");
        db.upsert_record(&rec).expect("first upsert");
        db.upsert_record(&rec).expect("second upsert");

        let conn = db.conn().expect("conn");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM images", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 1);

        let kv = db.kv_row("id-1", "steps").expect("kv").expect("row");
        assert_eq!(kv.0.as_deref(), Some("30"));
        assert_eq!(kv.1, Some(30.0));
        assert_eq!(kv.2, None);
    }

    #[test]
    fn kv_numeric_string_fills_both_text_and_num() {
        let (_dir, db) = test_db();
        db.upsert_record(&sample_record("id-1", "input/a.png"))
            .expect("upsert");
        let kv = db.kv_row("id-1", "seed_text").expect("kv").expect("row");
        assert_eq!(kv.0.as_deref(), Some("42"));
        assert_eq!(kv.1, Some(42.0));
    }

    #[test]
    fn kv_container_goes_to_json_slot() {
        let (_dir, db) = test_db();
        db.upsert_record(&sample_record("id-1", "input/a.png"))
            .expect("upsert");
        let kv = db.kv_row("id-1", "prompt_tokens").expect("kv").expect("row");
        assert_eq!(kv.0, None);
        assert!(kv.2.expect("json").contains("a cat"));
    }

    #[test]
    fn replace_resources_is_idempotent() {
        let (_dir, db) = test_db();
        db.upsert_record(&sample_record("id-1", "input/a.png"))
            .expect("upsert");

        let items = vec![Resource {
            kind: "lora".to_string(),
            name: "style".to_string(),
            version: None,
            hash: None,
            weight: Some(0.8),
            extra: Some(json!({"node_id": "4"})),
        }];
        db.replace_resources("id-1", &items).expect("first");
        db.replace_resources("id-1", &items).expect("second");

        let rows = db.resources_for_image("id-1").expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "lora");
        assert_eq!(rows[0].weight, Some(0.8));
    }

    #[test]
    fn model_version_upsert_keeps_earlier_non_null_columns() {
        let (_dir, db) = test_db();
        db.upsert_model_version(&ModelVersionRow {
            model_version_id: 123,
            kind: Some("lora".to_string()),
            name: Some("style".to_string()),
            urn: None,
            sha256: Some("a".repeat(64)),
            extra_json: None,
        })
        .expect("first");
        db.upsert_model_version(&ModelVersionRow {
            model_version_id: 123,
            kind: None,
            name: Some("style v2".to_string()),
            urn: Some("urn:civitai:modelVersion:123".to_string()),
            sha256: None,
            extra_json: None,
        })
        .expect("second");

        let row = db.model_version(123).expect("query").expect("row");
        assert_eq!(row.kind.as_deref(), Some("lora"));
        assert_eq!(row.name.as_deref(), Some("style v2"));
        assert_eq!(row.urn.as_deref(), Some("urn:civitai:modelVersion:123"));
        assert_eq!(row.sha256.as_deref(), Some(&"a".repeat(64)[..]));
    }

    #[test]
    fn resource_ref_rows_filter_by_kind_and_name() {
        let (_dir, db) = test_db();
        db.upsert_record(&sample_record("id-1", "input/a.png"))
            .expect("upsert");
        db.replace_resources(
            "id-1",
            &[
                Resource {
                    kind: "resource_ref".to_string(),
                    name: "modelVersionId:555".to_string(),
                    version: None,
                    hash: None,
                    weight: Some(1.0),
                    extra: None,
                },
                Resource {
                    kind: "checkpoint".to_string(),
                    name: "base.safetensors".to_string(),
                    version: None,
                    hash: None,
                    weight: Some(1.0),
                    extra: None,
                },
            ],
        )
        .expect("resources");

        let refs = db.resource_ref_rows().expect("refs");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name.as_deref(), Some("modelVersionId:555"));
    }
}
