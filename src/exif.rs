use crate::error::{PipelineError, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::process::{Command, Stdio};

/// Runs ExifTool recursively over a directory and returns its JSON array
/// output. A missing executable is surfaced as a dedicated error so the
/// CLI can explain what to install.
pub fn run_exiftool(exiftool: &str, input_dir: &Path) -> Result<Vec<Value>> {
    let output = Command::new(exiftool)
        .args([
            "-r",
            "-a",
            "-G1",
            "-s",
            "-n",
            "-charset",
            "utf8",
            "-api",
            "largefilesupport=1",
            "-j",
        ])
        .arg(input_dir)
        .stderr(Stdio::null())
        .output()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipelineError::Exif(format!(
                    "ExifTool not found ({exiftool}). Install exiftool or pass --exiftool."
                ))
            } else {
                PipelineError::Io(e)
            }
        })?;

    // ExifTool exits nonzero when some files had no readable metadata;
    // the JSON it did produce is still usable. Nonzero with nothing on
    // stdout means the run itself failed.
    if !output.status.success() && output.stdout.iter().all(u8::is_ascii_whitespace) {
        return Err(PipelineError::Exif(format!(
            "ExifTool failed ({}) with no output",
            output.status
        )));
    }
    let payload: Value = serde_json::from_slice(&output.stdout)
        .map_err(|_| PipelineError::Exif("ExifTool output was not a JSON array".to_string()))?;
    match payload {
        Value::Array(items) => Ok(items),
        _ => Err(PipelineError::Exif(
            "ExifTool output was not a JSON array".to_string(),
        )),
    }
}

fn record_key(item: &Value) -> String {
    ["SourceFile", "File:FileName", "FileName"]
        .iter()
        .find_map(|k| item.get(*k).and_then(Value::as_str).filter(|s| !s.is_empty()))
        .map(|s| s.replace('\\', "/").to_lowercase().trim().to_string())
        .unwrap_or_default()
}

fn load_existing_keys(out_jsonl: &Path) -> Result<HashSet<String>> {
    let mut keys = HashSet::new();
    if !out_jsonl.exists() {
        return Ok(keys);
    }
    let reader = BufReader::new(File::open(out_jsonl)?);
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(item) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let key = record_key(&item);
        if !key.is_empty() {
            keys.insert(key);
        }
    }
    Ok(keys)
}

fn ensure_trailing_newline(path: &Path) -> Result<()> {
    if !path.exists() || fs::metadata(path)?.len() == 0 {
        return Ok(());
    }
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        file.write_all(b"\n")?;
    }
    Ok(())
}

/// Appends ExifTool records to a JSONL file, skipping records whose
/// normalized source key is already present. Returns the number of lines
/// appended.
pub fn append_new_jsonl(items: &[Value], out_jsonl: &Path) -> Result<usize> {
    if let Some(parent) = out_jsonl.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut existing = load_existing_keys(out_jsonl)?;
    ensure_trailing_newline(out_jsonl)?;

    let mut out = OpenOptions::new().create(true).append(true).open(out_jsonl)?;
    let mut count = 0;
    for item in items {
        if !item.is_object() {
            continue;
        }
        let key = record_key(item);
        if !key.is_empty() && existing.contains(&key) {
            continue;
        }
        let line = serde_json::to_string(item)?;
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        if !key.is_empty() {
            existing.insert(key);
        }
        count += 1;
    }
    Ok(count)
}

/// Whether a directory tree contains at least one regular file.
pub fn has_any_file(dir: &Path) -> bool {
    fn walk(dir: &Path) -> bool {
        let Ok(entries) = fs::read_dir(dir) else {
            return false;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                return true;
            }
            if path.is_dir() && walk(&path) {
                return true;
            }
        }
        false
    }
    walk(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[cfg(unix)]
    fn fake_exiftool(dir: &Path, script: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("exiftool-stub.sh");
        fs::write(&path, script).expect("write stub");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod stub");
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_with_json_output_still_parses() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = fake_exiftool(
            dir.path(),
            "#!/bin/sh\necho '[{\"SourceFile\":\"input/a.png\"}]'\nexit 1\n",
        );
        let items = run_exiftool(&tool, dir.path()).expect("usable output");
        assert_eq!(items.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_without_output_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = fake_exiftool(dir.path(), "#!/bin/sh\nexit 2\n");
        let err = run_exiftool(&tool, dir.path()).expect_err("failed run");
        assert!(matches!(err, PipelineError::Exif(_)));
    }

    #[test]
    fn record_key_folds_separators_and_case() {
        assert_eq!(
            record_key(&json!({"SourceFile": "Input\\Sub\\A.PNG"})),
            "input/sub/a.png"
        );
        assert_eq!(record_key(&json!({"File:FileName": "b.png"})), "b.png");
        assert_eq!(record_key(&json!({"Other": 1})), "");
    }

    #[test]
    fn append_skips_already_seen_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("exif_raw.jsonl");

        let first = vec![
            json!({"SourceFile": "input/a.png", "PNG:Parameters": "x"}),
            json!({"SourceFile": "input/b.png"}),
        ];
        assert_eq!(append_new_jsonl(&first, &out).expect("first"), 2);

        // Same keys differently cased plus one new record.
        let second = vec![
            json!({"SourceFile": "Input/A.PNG"}),
            json!({"SourceFile": "input/c.png"}),
        ];
        assert_eq!(append_new_jsonl(&second, &out).expect("second"), 1);

        let text = fs::read_to_string(&out).expect("read");
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn append_repairs_missing_trailing_newline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("exif_raw.jsonl");
        fs::write(&out, "{\"SourceFile\":\"input/a.png\"}").expect("seed");

        let items = vec![json!({"SourceFile": "input/b.png"})];
        assert_eq!(append_new_jsonl(&items, &out).expect("append"), 1);

        let text = fs::read_to_string(&out).expect("read");
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn keyless_records_are_always_appended() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("exif_raw.jsonl");
        let items = vec![json!({"Other": 1}), json!({"Other": 2})];
        assert_eq!(append_new_jsonl(&items, &out).expect("first"), 2);
        assert_eq!(append_new_jsonl(&items, &out).expect("second"), 2);
    }

    #[test]
    fn has_any_file_walks_nested_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(!has_any_file(dir.path()));
        fs::create_dir_all(dir.path().join("a/b")).expect("mkdir");
        assert!(!has_any_file(dir.path()));
        fs::write(dir.path().join("a/b/x.png"), b"x").expect("write");
        assert!(has_any_file(dir.path()));
    }
}
