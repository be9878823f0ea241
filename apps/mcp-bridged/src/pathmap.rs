//! Path rewriting between callers and subprocesses.
//!
//! Inbound: user-supplied file names in configured `resolve_path_fields`
//! become workspace-absolute paths, and anything pointing outside the
//! workspace is refused before the subprocess ever sees it.
//!
//! Outbound: configured `file_path_fields` that name real files inside the
//! workspace gain a sibling `{field}_download_url`, and text blocks that
//! announce the file get a visible Markdown link appended. The original
//! path fields are left untouched so path-aware consumers keep working.

use std::path::{Component, Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("path `{value}` in field `{field}` escapes the workspace")]
pub struct PathEscape {
    pub field: String,
    pub value: String,
}

/// Substitute the `{WORKDIR}` token in a launch arg or env value.
pub fn substitute_workdir(input: &str, workdir: &Path) -> String {
    input.replace("{WORKDIR}", &workdir.to_string_lossy())
}

/// Rewrite inbound path fields to workspace-absolute paths, in place.
pub fn resolve_inbound(
    params: &mut Value,
    workspace: &Path,
    fields: &[String],
) -> Result<(), PathEscape> {
    if fields.is_empty() {
        return Ok(());
    }
    walk_inbound(params, workspace, fields)
}

fn walk_inbound(value: &mut Value, workspace: &Path, fields: &[String]) -> Result<(), PathEscape> {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if let Value::String(s) = child
                    && fields.iter().any(|f| f == key)
                {
                    match resolve_one(s, workspace) {
                        Some(resolved) => *s = resolved,
                        None => {
                            return Err(PathEscape {
                                field: key.clone(),
                                value: s.clone(),
                            });
                        }
                    }
                } else {
                    walk_inbound(child, workspace, fields)?;
                }
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                walk_inbound(item, workspace, fields)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// One inbound value. `None` means the path must be refused.
fn resolve_one(value: &str, workspace: &Path) -> Option<String> {
    if value.is_empty() {
        return None;
    }
    let path = Path::new(value);
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return None;
    }
    if path.is_absolute() {
        // Already workspace-absolute (a stateful caller replaying a path we
        // handed out earlier) is fine; anything else is not.
        return path.starts_with(workspace).then(|| value.to_string());
    }
    if value.contains(['/', '\\']) {
        return None;
    }
    Some(workspace.join(value).to_string_lossy().into_owned())
}

/// A workspace file surfaced as a download.
#[derive(Debug, Clone)]
pub struct ExposedFile {
    pub field: String,
    /// The path string exactly as the subprocess emitted it.
    pub original: String,
    pub basename: String,
    pub url: String,
}

/// Add `{field}_download_url` siblings for every configured path field whose
/// value names an existing file inside the workspace.
pub fn expose_downloads(
    result: &mut Value,
    workspace_dir: &Path,
    job_id: Uuid,
    base_url: &str,
    fields: &[String],
) -> Vec<ExposedFile> {
    let mut exposed = Vec::new();
    if fields.is_empty() {
        return exposed;
    }
    let base = base_url.trim_end_matches('/');
    walk_outbound(result, workspace_dir, job_id, base, fields, &mut exposed);
    exposed
}

fn walk_outbound(
    value: &mut Value,
    workspace_dir: &Path,
    job_id: Uuid,
    base_url: &str,
    fields: &[String],
    exposed: &mut Vec<ExposedFile>,
) {
    match value {
        Value::Object(map) => {
            annotate_object(map, workspace_dir, job_id, base_url, fields, exposed);
            for (_, child) in map.iter_mut() {
                walk_outbound(child, workspace_dir, job_id, base_url, fields, exposed);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                walk_outbound(item, workspace_dir, job_id, base_url, fields, exposed);
            }
        }
        _ => {}
    }
}

fn annotate_object(
    map: &mut Map<String, Value>,
    workspace_dir: &Path,
    job_id: Uuid,
    base_url: &str,
    fields: &[String],
    exposed: &mut Vec<ExposedFile>,
) {
    for field in fields {
        let Some(Value::String(raw)) = map.get(field) else {
            continue;
        };
        let Some(basename) = contained_file_basename(raw, workspace_dir) else {
            continue;
        };
        let url = format!("{base_url}/files/{job_id}/{basename}");
        exposed.push(ExposedFile {
            field: field.clone(),
            original: raw.clone(),
            basename,
            url: url.clone(),
        });
        map.insert(format!("{field}_download_url"), Value::String(url));
    }
}

/// Returns the basename when `raw` names an existing regular file inside the
/// workspace; symlink tricks are defeated by canonicalizing both sides.
fn contained_file_basename(raw: &str, workspace_dir: &Path) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let path = Path::new(raw);
    let full: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_dir.join(path)
    };
    let full = full.canonicalize().ok()?;
    let root = workspace_dir.canonicalize().ok()?;
    if !full.starts_with(&root) || !full.is_file() {
        return None;
    }
    Some(full.file_name()?.to_string_lossy().into_owned())
}

/// Append a human-visible Markdown link to text blocks that announce one of
/// the exposed files. The match is deliberately narrow: the emitted path
/// verbatim, or the basename together with the word "saved".
pub fn append_file_links(result: &mut Value, exposed: &[ExposedFile]) {
    if exposed.is_empty() {
        return;
    }
    walk_text_blocks(result, &mut |text| {
        for file in exposed {
            let announced = text.contains(&file.original)
                || (text.contains(&file.basename) && text.contains("saved"));
            if announced && !text.contains(&file.url) {
                text.push_str(&format!(
                    "\n\n📎 {}: [{}]({})",
                    file.basename, file.basename, file.url
                ));
            }
        }
    });
}

fn walk_text_blocks(value: &mut Value, visit: &mut impl FnMut(&mut String)) {
    match value {
        Value::Object(map) => {
            let is_text_block = map.get("type").and_then(Value::as_str) == Some("text");
            for (key, child) in map.iter_mut() {
                if is_text_block && key == "text" {
                    if let Value::String(text) = child {
                        visit(text);
                        continue;
                    }
                }
                walk_text_blocks(child, visit);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                walk_text_blocks(item, visit);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn inbound_basename_resolves_under_workspace() {
        let ws = Path::new("/jobs/abc");
        let mut params = serde_json::json!({
            "name": "save_presentation",
            "arguments": { "file_path": "out.pptx", "presentation_id": "P" }
        });
        resolve_inbound(&mut params, ws, &fields(&["file_path"])).expect("resolve");
        let rewritten = params["arguments"]["file_path"].as_str().expect("string");
        assert_eq!(rewritten, "/jobs/abc/out.pptx");
        assert!(Path::new(rewritten).starts_with(ws), "must stay inside workspace");
        assert_eq!(params["arguments"]["presentation_id"], "P", "other fields untouched");
    }

    #[test]
    fn inbound_workspace_absolute_is_kept() {
        let ws = Path::new("/jobs/abc");
        let mut params = serde_json::json!({ "file_path": "/jobs/abc/out.pptx" });
        resolve_inbound(&mut params, ws, &fields(&["file_path"])).expect("resolve");
        assert_eq!(params["file_path"], "/jobs/abc/out.pptx");
    }

    #[test]
    fn inbound_escapes_are_refused() {
        let ws = Path::new("/jobs/abc");
        for bad in [
            "../escape.txt",
            "/etc/passwd",
            "sub/../../x",
            "nested/file.txt",
            "..",
            "",
            "/jobs/abc2/out.pptx",
        ] {
            let mut params = serde_json::json!({ "filepath": bad });
            let err = resolve_inbound(&mut params, ws, &fields(&["filepath"]))
                .err()
                .unwrap_or_else(|| panic!("{bad:?} must be refused"));
            assert_eq!(err.field, "filepath");
        }
    }

    #[test]
    fn inbound_walks_nested_structures() {
        let ws = Path::new("/jobs/abc");
        let mut params = serde_json::json!({
            "batch": [ { "file_path": "a.txt" }, { "file_path": "b.txt" } ]
        });
        resolve_inbound(&mut params, ws, &fields(&["file_path"])).expect("resolve");
        assert_eq!(params["batch"][0]["file_path"], "/jobs/abc/a.txt");
        assert_eq!(params["batch"][1]["file_path"], "/jobs/abc/b.txt");
    }

    #[test]
    fn outbound_exposes_existing_files_only() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ws = tmp.path();
        std::fs::write(ws.join("out.pptx"), b"demo").expect("write file");
        let job_id = Uuid::new_v4();

        let mut result = serde_json::json!({
            "file_path": "out.pptx",
            "missing_path": "nowhere.pptx",
            "content": [ { "type": "text", "text": "out.pptx saved" } ]
        });
        let exposed = expose_downloads(
            &mut result,
            ws,
            job_id,
            "http://files.test/",
            &fields(&["file_path", "missing_path"]),
        );

        assert_eq!(exposed.len(), 1);
        let url = result["file_path_download_url"].as_str().expect("url");
        assert_eq!(url, format!("http://files.test/files/{job_id}/out.pptx"));
        assert_eq!(result["file_path"], "out.pptx", "original path preserved");
        assert!(result.get("missing_path_download_url").is_none());
    }

    #[test]
    fn outbound_rejects_files_outside_workspace() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).expect("mkdir");
        let outside = tmp.path().join("secret.txt");
        std::fs::write(&outside, b"x").expect("write file");

        let mut result = serde_json::json!({ "file_path": outside.to_string_lossy() });
        let exposed = expose_downloads(
            &mut result,
            &ws,
            Uuid::new_v4(),
            "http://files.test",
            &fields(&["file_path"]),
        );
        assert!(exposed.is_empty());
        assert!(result.get("file_path_download_url").is_none());
    }

    #[test]
    fn announced_files_get_markdown_links() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("out.pptx"), b"demo").expect("write file");
        let job_id = Uuid::new_v4();

        let mut result = serde_json::json!({
            "file_path": "out.pptx",
            "content": [
                { "type": "text", "text": "out.pptx saved" },
                { "type": "text", "text": "unrelated chatter" }
            ]
        });
        let exposed = expose_downloads(
            &mut result,
            tmp.path(),
            job_id,
            "http://files.test",
            &fields(&["file_path"]),
        );
        append_file_links(&mut result, &exposed);

        let announced = result["content"][0]["text"].as_str().expect("text");
        assert!(announced.contains('📎'), "got {announced}");
        assert!(announced.contains(&format!("/files/{job_id}/out.pptx")));
        assert_eq!(result["content"][1]["text"], "unrelated chatter");
    }

    #[test]
    fn workdir_token_substitution() {
        let dir = Path::new("/jobs/abc");
        assert_eq!(
            substitute_workdir("--workdir={WORKDIR}", dir),
            "--workdir=/jobs/abc"
        );
        assert_eq!(substitute_workdir("plain", dir), "plain");
    }
}
