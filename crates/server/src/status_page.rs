//! HTML listing of every stored metric.

use std::fmt::Write;

use tally_storage::MetricsSnapshot;

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn section<'a, V: std::fmt::Display + 'a>(
    html: &mut String,
    title: &str,
    rows: impl Iterator<Item = (&'a String, &'a V)>,
) {
    let _ = write!(html, "<h2>{title}</h2>\n<table>\n<tr><th>Name</th><th>Value</th></tr>\n");
    for (name, value) in rows {
        let _ = writeln!(html, "<tr><td>{}</td><td>{value}</td></tr>", escape(name));
    }
    html.push_str("</table>\n");
}

/// Render `snapshot` as a standalone HTML document.
pub fn render(snapshot: &MetricsSnapshot) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Metrics</title></head>\n<body>\n<h1>Metrics</h1>\n",
    );
    section(&mut html, "Counters", snapshot.counters.iter());
    section(&mut html, "Gauges", snapshot.gauges.iter());
    html.push_str("</body>\n</html>\n");
    html
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_counters_and_gauges() {
        let mut snapshot = MetricsSnapshot::default();
        snapshot.counters.insert("PollCount".into(), 12);
        snapshot.gauges.insert("Alloc".into(), 1.5);

        let html = render(&snapshot);
        assert!(html.contains("<tr><td>PollCount</td><td>12</td></tr>"));
        assert!(html.contains("<tr><td>Alloc</td><td>1.5</td></tr>"));
        assert!(html.find("Counters").unwrap() < html.find("Gauges").unwrap());
    }

    #[test]
    fn names_are_escaped() {
        let mut snapshot = MetricsSnapshot::default();
        snapshot.gauges.insert("<script>".into(), 1.0);
        let html = render(&snapshot);
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }
}
