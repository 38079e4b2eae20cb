#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;

use miette::IntoDiagnostic;
use serde::Serialize;
use shadow_core::FunctionReport;

pub const SCHEMA: &str = "shadowdp.transform-report/v1";

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub input: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub functions: Vec<FunctionReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformReport {
    pub schema: &'static str,
    pub files: Vec<FileReport>,
}

impl TransformReport {
    pub fn new(files: Vec<FileReport>) -> Self {
        Self { schema: SCHEMA, files }
    }
}

pub fn write_report(path: &Path, report: &TransformReport) -> miette::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).into_diagnostic()?;
    }
    let json = serde_json::to_string_pretty(report).into_diagnostic()?;
    fs::write(path, json).into_diagnostic()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_files_carry_the_error_and_no_output() {
        let report = TransformReport::new(vec![
            FileReport {
                input: "a.c".to_string(),
                ok: true,
                output: Some("a_t.c".to_string()),
                error: None,
                functions: Vec::new(),
            },
            FileReport {
                input: "b.c".to_string(),
                ok: false,
                output: None,
                error: Some("unbound variable `z`".to_string()),
                functions: Vec::new(),
            },
        ]);
        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["schema"], SCHEMA);
        assert_eq!(json["files"][0]["output"], "a_t.c");
        assert!(json["files"][0].get("error").is_none());
        assert!(json["files"][1].get("output").is_none());
        assert_eq!(json["files"][1]["error"], "unbound variable `z`");
    }
}
