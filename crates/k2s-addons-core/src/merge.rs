//! Text-level merge of one implementation into an installed manifest.
//!
//! The installed file is never re-serialized. The `implementations` block is
//! located by indentation, the matching list item is swapped out (or a new
//! item appended), and every other byte of the file, comments included, is
//! carried over unchanged.

use serde_yaml::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("cannot parse {which} manifest: {source}")]
    Parse {
        which: &'static str,
        source: serde_yaml::Error,
    },
    #[error("metadata.name differs: installed '{installed}', incoming '{incoming}'")]
    NameMismatch { installed: String, incoming: String },
    #[error("apiVersion differs: installed '{installed}', incoming '{incoming}'")]
    ApiVersionMismatch { installed: String, incoming: String },
    #[error("incoming manifest has no implementation '{0}'")]
    MissingImplementation(String),
    #[error("no block-style 'implementations' list found")]
    ImplementationsNotFound,
    #[error("merged manifest is invalid: {0}")]
    Invalid(String),
}

/// Merge `implementation` from the `incoming` manifest text into `installed`.
///
/// An item with the same name is replaced where it stands; otherwise the
/// item is appended after the last existing one.
pub fn merge_implementation(
    installed: &str,
    incoming: &str,
    implementation: &str,
) -> Result<String, MergeError> {
    let installed_doc = parse(installed, "installed")?;
    let incoming_doc = parse(incoming, "incoming")?;
    check_identity(&installed_doc, &incoming_doc)?;
    let item = find_implementation(&incoming_doc, implementation)
        .ok_or_else(|| MergeError::MissingImplementation(implementation.to_owned()))?;

    let eol = if installed.contains("\r\n") { "\r\n" } else { "\n" };
    let lines: Vec<&str> = installed.split_inclusive('\n').collect();
    let list = ImplementationsList::locate(&lines)?;
    let rendered = render_item(item, list.item_indent, eol)?;

    let mut merged = String::with_capacity(installed.len() + rendered.len());
    let (cut_start, cut_end) = match list
        .items
        .iter()
        .find(|i| i.name.as_deref() == Some(implementation))
    {
        Some(existing) => (existing.start, existing.end),
        None => (list.end, list.end),
    };
    lines[..cut_start].iter().for_each(|l| merged.push_str(l));
    if !merged.is_empty() && !merged.ends_with('\n') {
        merged.push_str(eol);
    }
    merged.push_str(&rendered);
    lines[cut_end..].iter().for_each(|l| merged.push_str(l));

    let expected = with_implementation(installed_doc, item, implementation);
    verify(&merged, &expected)?;
    Ok(merged)
}

fn parse(text: &str, which: &'static str) -> Result<Value, MergeError> {
    serde_yaml::from_str(text).map_err(|source| MergeError::Parse { which, source })
}

fn str_at<'a>(doc: &'a Value, path: &[&str]) -> &'a str {
    path.iter()
        .try_fold(doc, |v, key| v.get(*key))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn check_identity(installed: &Value, incoming: &Value) -> Result<(), MergeError> {
    let (a, b) = (
        str_at(installed, &["metadata", "name"]),
        str_at(incoming, &["metadata", "name"]),
    );
    if a != b {
        return Err(MergeError::NameMismatch {
            installed: a.to_owned(),
            incoming: b.to_owned(),
        });
    }
    let (a, b) = (
        str_at(installed, &["apiVersion"]),
        str_at(incoming, &["apiVersion"]),
    );
    if a != b {
        return Err(MergeError::ApiVersionMismatch {
            installed: a.to_owned(),
            incoming: b.to_owned(),
        });
    }
    Ok(())
}

fn implementations(doc: &Value) -> &[Value] {
    doc.get("spec")
        .and_then(|s| s.get("implementations"))
        .and_then(Value::as_sequence)
        .map_or(&[][..], Vec::as_slice)
}

fn find_implementation<'a>(doc: &'a Value, name: &str) -> Option<&'a Value> {
    implementations(doc)
        .iter()
        .find(|i| i.get("name").and_then(Value::as_str) == Some(name))
}

fn render_item(item: &Value, indent: usize, eol: &str) -> Result<String, MergeError> {
    let yaml = serde_yaml::to_string(&Value::Sequence(vec![item.clone()]))
        .map_err(|e| MergeError::Invalid(e.to_string()))?;
    let pad = " ".repeat(indent);
    let mut out = String::with_capacity(yaml.len() + indent * 8);
    for line in yaml.lines() {
        if !line.trim().is_empty() {
            out.push_str(&pad);
        }
        out.push_str(line);
        out.push_str(eol);
    }
    Ok(out)
}

/// The installed document with `item` replacing the same-named
/// implementation, or appended when there is none.
fn with_implementation(mut doc: Value, item: &Value, name: &str) -> Value {
    let list = doc
        .get_mut("spec")
        .and_then(|s| s.get_mut("implementations"))
        .and_then(Value::as_sequence_mut);
    if let Some(list) = list {
        match list
            .iter_mut()
            .find(|i| i.get("name").and_then(Value::as_str) == Some(name))
        {
            Some(existing) => *existing = item.clone(),
            None => list.push(item.clone()),
        }
    }
    doc
}

/// The spliced text must parse to exactly the expected document, so no
/// other implementation or header field was disturbed.
fn verify(merged: &str, expected: &Value) -> Result<(), MergeError> {
    let doc: Value =
        serde_yaml::from_str(merged).map_err(|e| MergeError::Invalid(e.to_string()))?;
    if doc == *expected {
        Ok(())
    } else {
        Err(MergeError::Invalid(
            "splice changed content outside the merged implementation".to_owned(),
        ))
    }
}

/// Item spans are line ranges, `end` exclusive, trailing blank and comment
/// lines at or left of the dash column excluded.
struct ListItem {
    start: usize,
    end: usize,
    name: Option<String>,
}

struct ImplementationsList {
    item_indent: usize,
    items: Vec<ListItem>,
    /// One past the last line of the last item.
    end: usize,
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

fn is_dash(line: &str) -> bool {
    let t = line.trim_start_matches(' ').trim_end();
    t == "-" || t.starts_with("- ")
}

fn is_list_key(line: &str) -> bool {
    line.trim()
        .strip_prefix("implementations:")
        .is_some_and(|rest| {
            let rest = rest.trim_start();
            rest.is_empty() || rest.starts_with('#')
        })
}

impl ImplementationsList {
    /// Extents come from indentation alone: every line indented deeper than
    /// the dash belongs to the item, whatever it starts with, since it may
    /// be block scalar content.
    fn locate(lines: &[&str]) -> Result<Self, MergeError> {
        let key = lines
            .iter()
            .position(|l| is_list_key(l))
            .ok_or(MergeError::ImplementationsNotFound)?;
        let key_indent = indent_of(lines[key]);

        let first = (key + 1..lines.len())
            .find(|&i| !is_blank(lines[i]) && !is_comment(lines[i]))
            .ok_or(MergeError::ImplementationsNotFound)?;
        let item_indent = indent_of(lines[first]);
        if !is_dash(lines[first]) || item_indent < key_indent {
            return Err(MergeError::ImplementationsNotFound);
        }

        let mut items: Vec<ListItem> = Vec::new();
        for (i, line) in lines.iter().enumerate().skip(first) {
            let indent = indent_of(line);
            if is_blank(line) {
                continue;
            }
            if indent > item_indent {
                if let Some(current) = items.last_mut() {
                    current.end = i + 1;
                }
            } else if indent == item_indent && is_dash(line) {
                items.push(ListItem {
                    start: i,
                    end: i + 1,
                    name: None,
                });
            } else if !is_comment(line) {
                break;
            }
        }
        for item in &mut items {
            item.name = item_name(&lines[item.start..item.end], item_indent);
        }
        let end = items.last().map_or(first + 1, |i| i.end);

        Ok(Self {
            item_indent,
            items,
            end,
        })
    }
}

fn item_name(lines: &[&str], indent: usize) -> Option<String> {
    let text: String = lines
        .iter()
        .map(|l| &l[indent_of(l).min(indent)..])
        .collect();
    let value: Value = serde_yaml::from_str(&text).ok()?;
    value
        .as_sequence()?
        .first()?
        .get("name")?
        .as_str()
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSTALLED: &str = "\
# SPDX-FileCopyrightText: local header
apiVersion: v1
kind: AddonManifest
metadata:
  name: ingress
  description: Ingress controllers # trailing comment
spec:
  implementations:
    # nginx comes first
    - name: nginx
      description: NGINX ingress
      offline_usage:
        linux:
          additionalImages: [registry.k8s.io/ingress-nginx/controller:v1.9.0]

    # traefik follows
    - name: traefik
      description: Traefik ingress
";

    fn incoming(name: &str, description: &str) -> String {
        format!(
            "apiVersion: v1\nkind: AddonManifest\nmetadata:\n  name: ingress\n  description: Ingress controllers\nspec:\n  implementations:\n  - name: {name}\n    description: {description}\n"
        )
    }

    fn names(text: &str) -> Vec<String> {
        let doc: Value = serde_yaml::from_str(text).unwrap();
        implementations(&doc)
            .iter()
            .map(|i| i["name"].as_str().unwrap().to_owned())
            .collect()
    }

    #[test]
    fn appends_new_implementation_preserving_text() {
        let merged =
            merge_implementation(INSTALLED, &incoming("contour", "Contour ingress"), "contour")
                .unwrap();
        assert!(merged.starts_with(INSTALLED));
        assert!(merged.ends_with("    - name: contour\n      description: Contour ingress\n"));
        assert_eq!(names(&merged), vec!["nginx", "traefik", "contour"]);
    }

    #[test]
    fn replaces_existing_implementation_in_place() {
        let merged =
            merge_implementation(INSTALLED, &incoming("nginx", "NGINX 2"), "nginx").unwrap();
        assert_eq!(names(&merged), vec!["nginx", "traefik"]);
        assert!(merged.contains("    # nginx comes first\n    - name: nginx\n      description: NGINX 2\n\n    # traefik follows\n"));
        assert!(!merged.contains("controller:v1.9.0"));
        assert!(merged.starts_with("# SPDX-FileCopyrightText: local header\n"));
        assert!(merged.ends_with("    - name: traefik\n      description: Traefik ingress\n"));
    }

    #[test]
    fn merge_is_idempotent() {
        let once = merge_implementation(INSTALLED, &incoming("contour", "C"), "contour").unwrap();
        let twice = merge_implementation(&once, &incoming("contour", "C"), "contour").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn items_at_key_indent_are_supported() {
        let installed = "apiVersion: v1\nkind: AddonManifest\nmetadata:\n  name: ingress\n  description: d\nspec:\n  implementations:\n  - name: nginx\n    description: n\nother: value\n";
        let merged = merge_implementation(installed, &incoming("traefik", "t"), "traefik").unwrap();
        assert_eq!(names(&merged), vec!["nginx", "traefik"]);
        assert!(merged.ends_with("  - name: traefik\n    description: t\nother: value\n"));
    }

    #[test]
    fn missing_trailing_newline_is_handled() {
        let installed = INSTALLED.trim_end();
        let merged = merge_implementation(installed, &incoming("contour", "C"), "contour").unwrap();
        assert_eq!(names(&merged), vec!["nginx", "traefik", "contour"]);
    }

    #[test]
    fn name_mismatch_is_a_conflict() {
        let other = incoming("x", "y").replace("name: ingress", "name: monitoring");
        assert!(matches!(
            merge_implementation(INSTALLED, &other, "x"),
            Err(MergeError::NameMismatch { .. })
        ));
    }

    #[test]
    fn api_version_mismatch_is_a_conflict() {
        let other = incoming("x", "y").replace("apiVersion: v1", "apiVersion: v2");
        assert!(matches!(
            merge_implementation(INSTALLED, &other, "x"),
            Err(MergeError::ApiVersionMismatch { .. })
        ));
    }

    #[test]
    fn flow_style_list_is_not_located() {
        let installed = "apiVersion: v1\nkind: AddonManifest\nmetadata:\n  name: ingress\n  description: d\nspec:\n  implementations: [{name: nginx}]\n";
        assert!(matches!(
            merge_implementation(installed, &incoming("traefik", "t"), "traefik"),
            Err(MergeError::ImplementationsNotFound)
        ));
    }

    #[test]
    fn incoming_without_implementation_is_rejected() {
        assert!(matches!(
            merge_implementation(INSTALLED, &incoming("nginx", "n"), "contour"),
            Err(MergeError::MissingImplementation(_))
        ));
    }

    #[test]
    fn hash_line_inside_block_scalar_stays_with_its_item() {
        let installed = "apiVersion: v1\nkind: AddonManifest\nmetadata:\n  name: ingress\n  description: d\nspec:\n  implementations:\n    - name: nginx\n      description: |\n        Line one\n        # keep me\n";
        let merged = merge_implementation(installed, &incoming("traefik", "t"), "traefik").unwrap();
        assert_eq!(names(&merged), vec!["nginx", "traefik"]);
        let doc: Value = serde_yaml::from_str(&merged).unwrap();
        assert_eq!(
            find_implementation(&doc, "nginx").unwrap()["description"],
            "Line one\n# keep me\n"
        );
        assert!(merged.ends_with("        # keep me\n    - name: traefik\n      description: t\n"));
    }

    #[test]
    fn replacing_item_with_hash_lines_drops_them_all() {
        let installed = "apiVersion: v1\nkind: AddonManifest\nmetadata:\n  name: ingress\n  description: d\nspec:\n  implementations:\n    - name: nginx\n      description: |\n        # first\n        # second\n    - name: traefik\n      description: t\n";
        let merged = merge_implementation(installed, &incoming("nginx", "plain"), "nginx").unwrap();
        assert_eq!(names(&merged), vec!["nginx", "traefik"]);
        assert!(!merged.contains("# first"));
        assert!(!merged.contains("# second"));
    }

    #[test]
    fn crlf_manifest_keeps_crlf_endings() {
        let installed = INSTALLED.replace('\n', "\r\n");
        for name in ["contour", "nginx"] {
            let merged = merge_implementation(&installed, &incoming(name, "x"), name).unwrap();
            assert!(
                !merged.replace("\r\n", "").contains('\n'),
                "bare LF in merged output: {merged:?}"
            );
            assert!(merged.contains(&format!("    - name: {name}\r\n      description: x\r\n")));
        }
    }

    #[test]
    fn crlf_manifest_without_trailing_newline_gets_crlf() {
        let installed = INSTALLED.replace('\n', "\r\n");
        let merged =
            merge_implementation(installed.trim_end(), &incoming("contour", "C"), "contour")
                .unwrap();
        assert!(merged.contains("Traefik ingress\r\n    - name: contour\r\n"));
        assert!(!merged.replace("\r\n", "").contains('\n'));
    }
}
