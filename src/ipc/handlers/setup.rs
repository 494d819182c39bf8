use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Gradebook,
    Import,
    Sessions,
}

impl SetupSection {
    const ALL: [SetupSection; 3] = [Self::Gradebook, Self::Import, Self::Sessions];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "gradebook" => Some(Self::Gradebook),
            "import" => Some(Self::Import),
            "sessions" => Some(Self::Sessions),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Gradebook => "gradebook",
            Self::Import => "import",
            Self::Sessions => "sessions",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Gradebook => "setup.gradebook",
            Self::Import => "setup.import",
            Self::Sessions => "setup.sessions",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Gradebook => json!({
            "includeInactive": false
        }),
        SetupSection::Import => json!({
            "defaultAttemptId": "main",
            "defaultMaxPoints": 100.0,
            "defaultFormat": "csvhead"
        }),
        SetupSection::Sessions => json!({
            "defaultPastEndOnly": true
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Gradebook => match k.as_str() {
                "includeInactive" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown gradebook field: {}", k)),
            },
            SetupSection::Import => match k.as_str() {
                "defaultAttemptId" => {
                    let s = parse_string_max(v, k, 64)?;
                    if s.is_empty() {
                        return Err(format!("{} must not be empty", k));
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "defaultMaxPoints" => {
                    let n = parse_f64_range(v, k, 0.0, 1_000_000.0)?;
                    obj.insert(k.clone(), json!(n));
                }
                "defaultFormat" => {
                    let s = parse_string_max(v, k, 16)?.to_ascii_lowercase();
                    if s != "csvhead" && s != "csv" {
                        return Err("defaultFormat must be one of: csvhead, csv".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                _ => return Err(format!("unknown import field: {}", k)),
            },
            SetupSection::Sessions => match k.as_str() {
                "defaultPastEndOnly" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown sessions field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Each stored field merges on its own; a malformed one keeps its default.
            for (k, v) in saved_obj {
                let mut field = Map::new();
                field.insert(k.clone(), v.clone());
                let _ = merge_section_patch(section, &mut current, &field);
            }
        }
    }
    Ok(current)
}

/// Effective defaults used by the other handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportDefaults {
    pub attempt_id: String,
    pub max_points: f64,
    pub format: String,
}

pub fn import_defaults(conn: &rusqlite::Connection) -> anyhow::Result<ImportDefaults> {
    let section = load_section(conn, SetupSection::Import)?;
    Ok(ImportDefaults {
        attempt_id: section
            .get("defaultAttemptId")
            .and_then(|v| v.as_str())
            .unwrap_or("main")
            .to_string(),
        max_points: section
            .get("defaultMaxPoints")
            .and_then(|v| v.as_f64())
            .unwrap_or(100.0),
        format: section
            .get("defaultFormat")
            .and_then(|v| v.as_str())
            .unwrap_or("csvhead")
            .to_string(),
    })
}

pub fn include_inactive_default(conn: &rusqlite::Connection) -> anyhow::Result<bool> {
    let section = load_section(conn, SetupSection::Gradebook)?;
    Ok(section
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false))
}

pub fn past_end_only_default(conn: &rusqlite::Connection) -> anyhow::Result<bool> {
    let section = load_section(conn, SetupSection::Sessions)?;
    Ok(section
        .get("defaultPastEndOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(true))
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut out = Map::new();
    for section in SetupSection::ALL {
        match load_section(conn, section) {
            Ok(v) => {
                out.insert(section.name().to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(section = section.name(), "setup section updated");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_rejects_unknown_fields_and_bad_formats() {
        let mut current = default_section(SetupSection::Import);
        let patch = json!({ "defaultFormat": "xlsx" });
        let res = merge_section_patch(
            SetupSection::Import,
            &mut current,
            patch.as_object().expect("object"),
        );
        assert!(res.is_err());

        let patch = json!({ "bogus": 1 });
        let res = merge_section_patch(
            SetupSection::Sessions,
            &mut current,
            patch.as_object().expect("object"),
        );
        assert!(res.is_err());
    }

    #[test]
    fn patch_normalizes_format_case() {
        let mut current = default_section(SetupSection::Import);
        let patch = json!({ "defaultFormat": "CSV", "defaultAttemptId": " retake " });
        merge_section_patch(
            SetupSection::Import,
            &mut current,
            patch.as_object().expect("object"),
        )
        .expect("merge");
        assert_eq!(current["defaultFormat"], "csv");
        assert_eq!(current["defaultAttemptId"], "retake");
    }

    #[test]
    fn stored_section_keeps_valid_fields_next_to_malformed_ones() {
        let ws = std::env::temp_dir().join(format!("gradebookd-setup-{}", uuid::Uuid::new_v4()));
        let conn = db::open_db(&ws).expect("open db");
        let saved = json!({
            "defaultAttemptId": 5,
            "defaultFormat": "csv",
            "defaultMaxPoints": 20.0
        });
        db::settings_set_json(&conn, SetupSection::Import.key(), &saved).expect("store");

        let section = load_section(&conn, SetupSection::Import).expect("load");
        assert_eq!(section["defaultAttemptId"], "main");
        assert_eq!(section["defaultFormat"], "csv");
        assert_eq!(section["defaultMaxPoints"], 20.0);
        drop(conn);
        let _ = std::fs::remove_dir_all(ws);
    }
}
