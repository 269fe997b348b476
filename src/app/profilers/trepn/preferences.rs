use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::app::error::HarnessError;

pub const PREF_DIR_NAME: &str = "trepn.pref";
pub const PREFERENCES_FILE: &str = "com.quicinc.trepn_preferences.xml";
pub const DATA_POINTS_FILE: &str = "com.quicinc.preferences.saved_data_points.xml";
const PREFERENCE_NAMESPACE: &str = "com.quicinc.preferences.";

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Short keys are placed in the Trepn preference namespace; dotted keys are used as given.
fn preference_name(key: &str) -> String {
    if key.contains('.') {
        key.to_string()
    } else {
        format!("{PREFERENCE_NAMESPACE}{key}")
    }
}

fn entry(key: &str, value: &Value) -> String {
    let name = escape(&preference_name(key));
    match value {
        Value::Bool(flag) => format!("    <boolean name=\"{name}\" value=\"{flag}\" />"),
        Value::Number(number) if number.is_i64() || number.is_u64() => {
            format!("    <int name=\"{name}\" value=\"{number}\" />")
        }
        Value::String(text) => format!("    <string name=\"{name}\">{}</string>", escape(text)),
        other => format!("    <string name=\"{name}\">{}</string>", escape(&other.to_string())),
    }
}

fn shared_prefs(entries: Vec<String>) -> String {
    let mut xml = String::from("<?xml version='1.0' encoding='utf-8' standalone='yes' ?>\n<map>\n");
    for entry in entries {
        xml.push_str(&entry);
        xml.push('\n');
    }
    xml.push_str("</map>\n");
    xml
}

pub fn preferences_xml(preferences: &Map<String, Value>) -> String {
    shared_prefs(
        preferences
            .iter()
            .map(|(key, value)| entry(key, value))
            .collect(),
    )
}

pub fn data_points_xml(stat_ids: &[String]) -> String {
    shared_prefs(
        stat_ids
            .iter()
            .map(|id| format!("    <boolean name=\"{}\" value=\"true\" />", escape(id)))
            .collect(),
    )
}

/// Writes the preference bundle pushed to the device and returns its directory.
pub fn build_preferences(
    work_dir: &Path,
    preferences: &Map<String, Value>,
    stat_ids: &[String],
) -> Result<PathBuf, HarnessError> {
    let dir = work_dir.join(PREF_DIR_NAME);
    let write_err = |path: &Path, err: std::io::Error| {
        HarnessError::profiler(
            format!("Failed to write Trepn preferences {}: {err}", path.display()),
            "",
        )
    };
    fs::create_dir_all(&dir).map_err(|err| write_err(&dir, err))?;
    let pref_file = dir.join(PREFERENCES_FILE);
    fs::write(&pref_file, preferences_xml(preferences)).map_err(|err| write_err(&pref_file, err))?;
    let points_file = dir.join(DATA_POINTS_FILE);
    fs::write(&points_file, data_points_xml(stat_ids)).map_err(|err| write_err(&points_file, err))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn preferences_are_typed_and_namespaced() {
        let prefs = json!({"profiling_interval": 300, "temperature_units": "Celsius", "show_deltas": true});
        let xml = preferences_xml(prefs.as_object().unwrap());
        assert!(xml.contains("<int name=\"com.quicinc.preferences.profiling_interval\" value=\"300\" />"));
        assert!(xml.contains("<string name=\"com.quicinc.preferences.temperature_units\">Celsius</string>"));
        assert!(xml.contains("<boolean name=\"com.quicinc.preferences.show_deltas\" value=\"true\" />"));
        assert!(xml.starts_with("<?xml"));
        assert!(xml.ends_with("</map>\n"));
    }

    #[test]
    fn values_are_escaped() {
        let prefs = json!({"com.example.label": "a<b & \"c\""});
        let xml = preferences_xml(prefs.as_object().unwrap());
        assert!(xml.contains("<string name=\"com.example.label\">a&lt;b &amp; &quot;c&quot;</string>"));
    }

    #[test]
    fn build_preferences_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = json!({"profiling_interval": 300});
        let ids = vec!["332".to_string(), "328".to_string()];

        let pref_dir = build_preferences(dir.path(), prefs.as_object().unwrap(), &ids).unwrap();

        assert_eq!(pref_dir, dir.path().join("trepn.pref"));
        assert!(pref_dir.join(PREFERENCES_FILE).is_file());
        let points = fs::read_to_string(pref_dir.join(DATA_POINTS_FILE)).unwrap();
        assert!(points.contains("<boolean name=\"332\" value=\"true\" />"));
        assert!(points.contains("<boolean name=\"328\" value=\"true\" />"));
    }
}
