use html_scraper::{ElementRef, Html, Selector};
use serde_json::Value;

const SKIP_TAGS: [&str; 9] = [
    "script", "style", "nav", "footer", "aside", "header", "form", "iframe", "noscript",
];

// Ordered by specificity; `body` is the catch-all.
const CONTENT_SELECTORS: [&str; 15] = [
    "main",
    "article",
    "[role=\"main\"]",
    ".content",
    "#content",
    ".main-content",
    ".post-content",
    ".entry-content",
    ".docs-content",
    ".documentation",
    ".readme",
    ".markdown-body",
    ".product-description",
    ".pricing",
    "body",
];

const JS_REQUIRED_PHRASES: [&str; 4] = [
    "this page requires javascript",
    "please enable javascript",
    "requires javascript to view",
    "javascript is required",
];

const JSONLD_TYPES: [&str; 4] = ["softwareapplication", "product", "organization", "website"];

fn sel(s: &str) -> Option<Selector> {
    Selector::parse(s).ok()
}

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        if let Some(e) = ElementRef::wrap(child) {
            let tag = e.value().name();
            if SKIP_TAGS.contains(&tag) {
                continue;
            }
            match tag {
                "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                    out.push_str("\n## ");
                    collect_text(e, out);
                    out.push('\n');
                }
                "li" => {
                    out.push_str("\n- ");
                    collect_text(e, out);
                }
                "p" | "div" | "section" | "article" | "table" | "tr" | "ul" | "ol" | "pre"
                | "blockquote" => {
                    out.push('\n');
                    collect_text(e, out);
                }
                "br" => out.push('\n'),
                _ => collect_text(e, out),
            }
        } else if let Some(t) = child.value().as_text() {
            out.push_str(t);
            out.push(' ');
        }
    }
}

fn clean_lines(raw: &str) -> String {
    raw.lines()
        .map(norm_ws)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn meta_content(doc: &Html, selector: &str) -> Option<String> {
    let s = sel(selector)?;
    doc.select(&s)
        .find_map(|e| e.value().attr("content"))
        .map(norm_ws)
        .filter(|v| !v.is_empty())
}

fn page_title(doc: &Html) -> Option<String> {
    let s = sel("title")?;
    doc.select(&s)
        .next()
        .map(|e| norm_ws(&e.text().collect::<String>()))
        .filter(|t| !t.is_empty())
}

fn jsonld_objects(v: &Value, out: &mut Vec<Value>) {
    match v {
        Value::Array(items) => {
            for item in items {
                jsonld_objects(item, out);
            }
        }
        Value::Object(map) => {
            if let Some(graph) = map.get("@graph") {
                jsonld_objects(graph, out);
            }
            out.push(v.clone());
        }
        _ => {}
    }
}

fn jsonld_type_matches(obj: &Value) -> Option<String> {
    let ty = obj.get("@type")?;
    let names: Vec<String> = match ty {
        Value::String(s) => vec![s.clone()],
        Value::Array(a) => a
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        _ => return None,
    };
    names
        .into_iter()
        .find(|n| JSONLD_TYPES.contains(&n.to_ascii_lowercase().as_str()))
}

fn jsonld_lines(doc: &Html) -> Vec<String> {
    let Some(s) = sel("script[type=\"application/ld+json\"]") else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for script in doc.select(&s) {
        let raw = script.text().collect::<String>();
        let Ok(v) = serde_json::from_str::<Value>(&raw) else {
            continue;
        };
        let mut objs = Vec::new();
        jsonld_objects(&v, &mut objs);
        for obj in objs {
            let Some(ty) = jsonld_type_matches(&obj) else {
                continue;
            };
            let name = obj.get("name").and_then(|n| n.as_str()).unwrap_or("");
            let desc = obj
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or("");
            if name.is_empty() && desc.is_empty() {
                continue;
            }
            let line = if desc.is_empty() {
                format!("{ty}: {}", norm_ws(name))
            } else if name.is_empty() {
                format!("{ty}: {}", norm_ws(desc))
            } else {
                format!("{ty}: {} - {}", norm_ws(name), norm_ws(desc))
            };
            out.push(line);
        }
    }
    out
}

/// Title, meta/OpenGraph/Twitter descriptions, and JSON-LD software entities,
/// one line each. Gives the analysis stage a summary even when the page body
/// is thin.
fn structured_prefix(doc: &Html) -> Vec<String> {
    let mut lines = Vec::new();
    let title = page_title(doc);
    if let Some(t) = &title {
        lines.push(format!("# {t}"));
    }
    if let Some(d) = meta_content(doc, "meta[name=\"description\"]") {
        lines.push(d);
    }
    if let Some(ogt) = meta_content(doc, "meta[property=\"og:title\"]") {
        if title.as_deref() != Some(ogt.as_str()) {
            lines.push(ogt);
        }
    }
    if let Some(ogd) = meta_content(doc, "meta[property=\"og:description\"]") {
        if !lines.contains(&ogd) {
            lines.push(ogd);
        }
    }
    if let Some(twd) = meta_content(
        doc,
        "meta[name=\"twitter:description\"], meta[property=\"twitter:description\"]",
    ) {
        if !lines.contains(&twd) {
            lines.push(twd);
        }
    }
    lines.extend(jsonld_lines(doc));
    lines
}

fn main_text(doc: &Html, min_len: usize) -> String {
    let mut best = String::new();
    for selector in CONTENT_SELECTORS {
        let Some(s) = sel(selector) else { continue };
        let Some(el) = doc.select(&s).next() else {
            continue;
        };
        let mut raw = String::new();
        collect_text(el, &mut raw);
        let cleaned = clean_lines(&raw);
        if cleaned.chars().count() >= min_len {
            return cleaned;
        }
        if cleaned.len() > best.len() {
            best = cleaned;
        }
    }
    best
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

/// Extract readable text from an HTML page. Returns `None` when the page is a
/// JavaScript shell or yields less than `min_len` characters; output is capped
/// at `max_len` characters.
pub fn extract_content(html: &str, min_len: usize, max_len: usize) -> Option<String> {
    let doc = Html::parse_document(html);

    let body = main_text(&doc, min_len);
    let lower = body.to_lowercase();
    if JS_REQUIRED_PHRASES.iter().any(|p| lower.contains(p)) {
        return None;
    }

    let mut combined = structured_prefix(&doc).join("\n");
    if !body.is_empty() {
        if !combined.is_empty() {
            combined.push_str("\n\n");
        }
        combined.push_str(&body);
    }
    let combined = combined.trim().to_string();
    if combined.chars().count() < min_len {
        return None;
    }
    Some(truncate_chars(&combined, max_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RICH_PAGE: &str = r#"
    <html>
      <head>
        <title>Acme CI - Continuous Integration</title>
        <meta name="description" content="Acme CI builds and tests your code.">
        <meta property="og:description" content="Hosted CI for busy teams.">
        <script type="application/ld+json">
          {"@type":"SoftwareApplication","name":"Acme CI","description":"CI service"}
        </script>
      </head>
      <body>
        <nav>Home Pricing Docs Login Signup</nav>
        <main>
          <h1>Acme CI</h1>
          <p>Acme CI runs your builds on every push and reports status checks back
          to your pull requests within seconds of the commit landing.</p>
          <ul><li>Parallel builds</li><li>Docker support</li></ul>
          <script>trackPageView();</script>
        </main>
        <footer>Copyright Acme</footer>
      </body>
    </html>
    "#;

    #[test]
    fn extracts_main_content_and_skips_boilerplate() {
        let out = extract_content(RICH_PAGE, 50, 8000).unwrap();
        assert!(out.contains("runs your builds on every push"));
        assert!(out.contains("- Parallel builds"));
        assert!(out.contains("## Acme CI"));
        assert!(!out.contains("Login Signup"));
        assert!(!out.contains("trackPageView"));
        assert!(!out.contains("Copyright Acme"));
    }

    #[test]
    fn structured_prefix_includes_meta_and_jsonld() {
        let out = extract_content(RICH_PAGE, 50, 8000).unwrap();
        assert!(out.starts_with("# Acme CI - Continuous Integration"));
        assert!(out.contains("Acme CI builds and tests your code."));
        assert!(out.contains("Hosted CI for busy teams."));
        assert!(out.contains("SoftwareApplication: Acme CI - CI service"));
    }

    #[test]
    fn short_content_returns_none() {
        let html = "<html><body><main><p>tiny</p></main></body></html>";
        assert!(extract_content(html, 100, 8000).is_none());
    }

    #[test]
    fn js_required_page_returns_none() {
        let html = r#"<html><body><main>
            <p>Please enable JavaScript to continue using this application and
            reload the page once scripts are allowed to run in your browser.</p>
        </main></body></html>"#;
        assert!(extract_content(html, 50, 8000).is_none());
    }

    #[test]
    fn output_is_capped_at_max_len() {
        let long = "word ".repeat(5000);
        let html = format!("<html><body><main><p>{long}</p></main></body></html>");
        let out = extract_content(&html, 50, 500).unwrap();
        assert!(out.chars().count() <= 500);
    }

    #[test]
    fn jsonld_graph_and_type_arrays_are_handled() {
        let html = r#"<html><head>
          <script type="application/ld+json">
            {"@graph":[{"@type":["Thing","Product"],"name":"Widget","description":"A widget"}]}
          </script>
        </head><body><main><p>Widget is a fine product that slices, dices and
        otherwise processes input data quickly and reliably for most teams.</p>
        </main></body></html>"#;
        let out = extract_content(html, 50, 8000).unwrap();
        assert!(out.contains("Product: Widget - A widget"));
    }

    #[test]
    fn falls_back_to_body_when_no_container_matches() {
        let html = r#"<html><body><p>This page has no main or article wrapper
        but still carries enough prose to be worth keeping for analysis of the
        product described here.</p></body></html>"#;
        let out = extract_content(html, 50, 8000).unwrap();
        assert!(out.contains("no main or article wrapper"));
    }
}
